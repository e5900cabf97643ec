//! # Column Storage
//!
//! Dense, type-erased component columns.
//!
//! An archetype stores one column per kind in its sequence. Row `i` of
//! every column belongs to the entity at position `i` of the id list, so
//! every structural operation (push, swap-remove, clear) is applied to all
//! columns of a collection in lockstep.

use std::any::Any;

use super::component::Component;
use crate::error::CollectionError;

/// Object-safe view of a [`Column`].
pub trait ErasedColumn: Send + Sync + 'static {
    /// Number of rows.
    fn len(&self) -> usize;

    /// Whether the column has no rows.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a default-constructed row.
    fn push_default(&mut self);

    /// Removes `row` by moving the last row into its place.
    ///
    /// # Panics
    ///
    /// Panics if `row` is out of bounds.
    fn swap_remove(&mut self, row: usize);

    /// Appends a copy of `row` from another column of the same type.
    ///
    /// # Errors
    ///
    /// Returns [`CollectionError::ColumnCopy`] if `source` stores a different
    /// type.
    fn push_from(&mut self, source: &dyn ErasedColumn, row: usize) -> Result<(), CollectionError>;

    /// Removes every row, keeping the allocation.
    fn clear(&mut self);

    /// Reserves room for `additional` rows.
    fn reserve(&mut self, additional: usize);

    /// Rows viewed as raw bytes.
    fn bytes(&self) -> &[u8];

    /// Name of the stored Rust type.
    fn type_name(&self) -> &'static str;

    /// Upcast for typed access.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for typed access.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Dense array of one component type.
///
/// # Type Parameters
///
/// * `C` - The component type to store
///
/// # Example
///
/// ```rust,ignore
/// let mut column: Column<Health> = Column::new();
/// column.push(Health { current: 10, max: 10 });
/// ```
#[derive(Clone, Debug, Default)]
pub struct Column<C: Component> {
    data: Vec<C>,
}

impl<C: Component> Column<C> {
    /// Creates an empty column.
    #[must_use]
    pub const fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Creates an empty boxed column. Used as the registry's factory.
    #[must_use]
    pub fn boxed() -> Box<dyn ErasedColumn> {
        Box::new(Self::new())
    }

    /// Appends a value.
    #[inline]
    pub fn push(&mut self, value: C) {
        self.data.push(value);
    }

    /// Gets a row.
    ///
    /// # Returns
    ///
    /// Reference to the component, or None if `row` is out of bounds.
    #[inline]
    #[must_use]
    pub fn get(&self, row: usize) -> Option<&C> {
        self.data.get(row)
    }

    /// Returns all rows as a slice.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[C] {
        &self.data
    }

    /// Returns all rows as a mutable slice.
    #[inline]
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [C] {
        &mut self.data
    }
}

impl<C: Component> ErasedColumn for Column<C> {
    #[inline]
    fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    fn push_default(&mut self) {
        self.data.push(C::default());
    }

    #[inline]
    fn swap_remove(&mut self, row: usize) {
        self.data.swap_remove(row);
    }

    fn push_from(&mut self, source: &dyn ErasedColumn, row: usize) -> Result<(), CollectionError> {
        let value = source
            .as_any()
            .downcast_ref::<Self>()
            .and_then(|column| column.get(row))
            .ok_or(CollectionError::ColumnCopy)?;
        self.data.push(*value);
        Ok(())
    }

    #[inline]
    fn clear(&mut self) {
        self.data.clear();
    }

    #[inline]
    fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<C>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
