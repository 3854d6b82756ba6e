//! Linear index mappers.
//!
//! Kernels address flat buffers through multi-dimensional indices. Each
//! buffer shape has its own [`LinearIndexMapper`] implementation so the
//! offset arithmetic is resolved statically. Every per-dimension index must be
//! smaller than its extent; out-of-range indices panic instead of wrapping
//! into a neighboring row.

use std::marker::PhantomData;

/// Marker trait for the storage order of a two-level buffer.
pub trait Layout: Copy + Send + Sync + 'static {
    /// True when the outer index varies fastest.
    const OUTER_FASTEST: bool;
}

/// Array-of-structs order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aos;

/// Struct-of-arrays order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Soa;

impl Layout for Aos {
    const OUTER_FASTEST: bool = false;
}

impl Layout for Soa {
    const OUTER_FASTEST: bool = true;
}

/// Converts between a multi-dimensional index and a linear offset.
pub trait LinearIndexMapper {
    /// Per-dimension index tuple.
    type Index: Copy;

    /// Sizes of every dimension of the index space.
    fn extents(&self) -> Self::Index;

    /// Total number of addressable elements.
    fn size(&self) -> usize;

    /// Linear offset of `index`. Panics if any component is out of range.
    fn flatten(&self, index: Self::Index) -> usize;

    /// Inverse of [`LinearIndexMapper::flatten`]. Panics if `offset >= size()`.
    fn unflatten(&self, offset: usize) -> Self::Index;
}

#[inline]
#[track_caller]
fn check(what: &str, index: usize, extent: usize) {
    assert!(
        index < extent,
        "{} index {} out of range for extent {}",
        what,
        index,
        extent
    );
}

/// (point, dim) over (num_points, dims).
#[derive(Debug, Clone, Copy)]
pub struct PointDim<L: Layout> {
    num_points: usize,
    dims: usize,
    _layout: PhantomData<L>,
}

impl<L: Layout> PointDim<L> {
    pub fn new(num_points: usize, dims: usize) -> Self {
        Self {
            num_points,
            dims,
            _layout: PhantomData,
        }
    }
}

impl<L: Layout> LinearIndexMapper for PointDim<L> {
    type Index = (usize, usize);

    fn extents(&self) -> (usize, usize) {
        (self.num_points, self.dims)
    }

    fn size(&self) -> usize {
        self.num_points * self.dims
    }

    #[inline]
    #[track_caller]
    fn flatten(&self, (point, dim): (usize, usize)) -> usize {
        check("point", point, self.num_points);
        check("dim", dim, self.dims);
        if L::OUTER_FASTEST {
            dim * self.num_points + point
        } else {
            point * self.dims + dim
        }
    }

    #[track_caller]
    fn unflatten(&self, offset: usize) -> (usize, usize) {
        check("offset", offset, self.size());
        if L::OUTER_FASTEST {
            (offset % self.num_points, offset / self.num_points)
        } else {
            (offset / self.dims, offset % self.dims)
        }
    }
}

/// (table, slot) over (num_tables, slots_per_rank).
#[derive(Debug, Clone, Copy)]
pub struct TableSlot {
    num_tables: usize,
    slots: usize,
}

impl TableSlot {
    pub fn new(num_tables: usize, slots: usize) -> Self {
        Self { num_tables, slots }
    }
}

impl LinearIndexMapper for TableSlot {
    type Index = (usize, usize);

    fn extents(&self) -> (usize, usize) {
        (self.num_tables, self.slots)
    }

    fn size(&self) -> usize {
        self.num_tables * self.slots
    }

    #[inline]
    #[track_caller]
    fn flatten(&self, (table, slot): (usize, usize)) -> usize {
        check("table", table, self.num_tables);
        check("slot", slot, self.slots);
        table * self.slots + slot
    }

    #[track_caller]
    fn unflatten(&self, offset: usize) -> (usize, usize) {
        check("offset", offset, self.size());
        (offset / self.slots, offset % self.slots)
    }
}

/// (table, function, coefficient) over (tables, functions, coefficients).
///
/// With [`Soa`] the function index varies fastest within one table, so
/// coefficient `c` of all functions of a table is contiguous.
#[derive(Debug, Clone, Copy)]
pub struct HashCoefficient<L: Layout> {
    tables: usize,
    functions: usize,
    coefficients: usize,
    _layout: PhantomData<L>,
}

impl<L: Layout> HashCoefficient<L> {
    pub fn new(tables: usize, functions: usize, coefficients: usize) -> Self {
        Self {
            tables,
            functions,
            coefficients,
            _layout: PhantomData,
        }
    }
}

impl<L: Layout> LinearIndexMapper for HashCoefficient<L> {
    type Index = (usize, usize, usize);

    fn extents(&self) -> (usize, usize, usize) {
        (self.tables, self.functions, self.coefficients)
    }

    fn size(&self) -> usize {
        self.tables * self.functions * self.coefficients
    }

    #[inline]
    #[track_caller]
    fn flatten(&self, (table, function, coefficient): (usize, usize, usize)) -> usize {
        check("table", table, self.tables);
        check("function", function, self.functions);
        check("coefficient", coefficient, self.coefficients);
        let base = table * self.functions * self.coefficients;
        if L::OUTER_FASTEST {
            base + coefficient * self.functions + function
        } else {
            base + function * self.coefficients + coefficient
        }
    }

    #[track_caller]
    fn unflatten(&self, offset: usize) -> (usize, usize, usize) {
        check("offset", offset, self.size());
        let per_table = self.functions * self.coefficients;
        let table = offset / per_table;
        let rest = offset % per_table;
        if L::OUTER_FASTEST {
            (table, rest % self.functions, rest / self.functions)
        } else {
            (table, rest / self.coefficients, rest % self.coefficients)
        }
    }
}

/// (point, table) over (num_points, num_tables), used for flat signature buffers.
#[derive(Debug, Clone, Copy)]
pub struct PointTable {
    num_points: usize,
    num_tables: usize,
}

impl PointTable {
    pub fn new(num_points: usize, num_tables: usize) -> Self {
        Self {
            num_points,
            num_tables,
        }
    }
}

impl LinearIndexMapper for PointTable {
    type Index = (usize, usize);

    fn extents(&self) -> (usize, usize) {
        (self.num_points, self.num_tables)
    }

    fn size(&self) -> usize {
        self.num_points * self.num_tables
    }

    #[inline]
    #[track_caller]
    fn flatten(&self, (point, table): (usize, usize)) -> usize {
        check("point", point, self.num_points);
        check("table", table, self.num_tables);
        point * self.num_tables + table
    }

    #[track_caller]
    fn unflatten(&self, offset: usize) -> (usize, usize) {
        check("offset", offset, self.size());
        (offset / self.num_tables, offset % self.num_tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_bijective<M: LinearIndexMapper>(mapper: &M)
    where
        M::Index: PartialEq + std::fmt::Debug,
    {
        let mut seen = vec![false; mapper.size()];
        for offset in 0..mapper.size() {
            let idx = mapper.unflatten(offset);
            assert_eq!(mapper.flatten(idx), offset);
            assert!(!seen[offset]);
            seen[offset] = true;
        }
    }

    #[test]
    fn test_point_dim_layouts() {
        let aos = PointDim::<Aos>::new(4, 3);
        assert_eq!(aos.flatten((1, 2)), 5);
        let soa = PointDim::<Soa>::new(4, 3);
        assert_eq!(soa.flatten((1, 2)), 9);
        assert_bijective(&aos);
        assert_bijective(&soa);
    }

    #[test]
    fn test_hash_coefficient_layouts() {
        let aos = HashCoefficient::<Aos>::new(2, 3, 5);
        assert_eq!(aos.flatten((1, 2, 4)), 15 + 10 + 4);
        let soa = HashCoefficient::<Soa>::new(2, 3, 5);
        assert_eq!(soa.flatten((1, 2, 4)), 15 + 12 + 2);
        assert_bijective(&aos);
        assert_bijective(&soa);
    }

    #[test]
    fn test_table_slot_and_point_table() {
        let ts = TableSlot::new(3, 7);
        assert_eq!(ts.flatten((2, 6)), 20);
        assert_eq!(ts.size(), 21);
        assert_bijective(&ts);

        let pt = PointTable::new(5, 2);
        assert_eq!(pt.unflatten(7), (3, 1));
        assert_bijective(&pt);
    }

    #[test]
    #[should_panic(expected = "dim index 3 out of range")]
    fn test_out_of_range_panics() {
        // (0, 3) would alias (1, 0) if it wrapped
        PointDim::<Aos>::new(4, 3).flatten((0, 3));
    }

    #[test]
    #[should_panic(expected = "offset")]
    fn test_unflatten_out_of_range_panics() {
        TableSlot::new(2, 2).unflatten(4);
    }
}
