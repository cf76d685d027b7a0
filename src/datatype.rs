//! Describing the elements of a partitioned buffer
//!
//! A partitioned request never looks at the data it moves. The only thing it needs to know about
//! the element type is its *extent*, the distance in bytes between two consecutive elements, so
//! that it can cut the caller's buffer into `partitions` contiguous byte ranges of
//! `count * extent` bytes each.
//!
//! The relationship between a Rust type and its datatype descriptor is covered by the
//! `Equivalence` trait, which is implemented for the primitive numeric types, `bool`, arrays of
//! equivalent types and, with the `complex` feature, `num_complex::Complex32` and `Complex64`.

use std::mem;

/// Datatype traits
pub mod traits {
    pub use super::Equivalence;
}

/// Descriptor of an element type
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SystemDatatype {
    name: &'static str,
    extent: usize,
}

impl SystemDatatype {
    /// Describe a type called `name` whose consecutive elements are `extent` bytes apart.
    pub const fn new(name: &'static str, extent: usize) -> Self {
        SystemDatatype { name, extent }
    }

    /// Name of the datatype, e.g. `"f64"`
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Distance in bytes between the start of two consecutive elements
    pub fn extent(&self) -> usize {
        self.extent
    }

    /// Number of bytes spanned by `count` consecutive elements, `None` on overflow.
    pub fn span(&self, count: usize) -> Option<usize> {
        count.checked_mul(self.extent)
    }
}

/// A direct equivalence exists between the implementing type and a datatype descriptor
///
/// # Safety
///
/// Partitioned requests copy values of the implementing type as raw bytes between buffers. Every
/// bit pattern produced by such a copy from a valid value must again be a valid value, and the
/// extent reported by `equivalent_datatype()` must equal `mem::size_of::<Self>()`.
pub unsafe trait Equivalence: Copy {
    /// The datatype descriptor equivalent to this Rust type
    fn equivalent_datatype() -> SystemDatatype;
}

macro_rules! equivalent_system_datatype {
    ($rstype:ty, $name:expr) => {
        unsafe impl Equivalence for $rstype {
            fn equivalent_datatype() -> SystemDatatype {
                SystemDatatype::new($name, mem::size_of::<$rstype>())
            }
        }
    };
}

equivalent_system_datatype!(bool, "bool");

equivalent_system_datatype!(f32, "f32");
equivalent_system_datatype!(f64, "f64");

equivalent_system_datatype!(i8, "i8");
equivalent_system_datatype!(i16, "i16");
equivalent_system_datatype!(i32, "i32");
equivalent_system_datatype!(i64, "i64");

equivalent_system_datatype!(u8, "u8");
equivalent_system_datatype!(u16, "u16");
equivalent_system_datatype!(u32, "u32");
equivalent_system_datatype!(u64, "u64");

equivalent_system_datatype!(isize, "isize");
equivalent_system_datatype!(usize, "usize");

#[cfg(feature = "complex")]
equivalent_system_datatype!(num_complex::Complex32, "complex32");
#[cfg(feature = "complex")]
equivalent_system_datatype!(num_complex::Complex64, "complex64");

unsafe impl<T: Equivalence, const N: usize> Equivalence for [T; N] {
    fn equivalent_datatype() -> SystemDatatype {
        let element = T::equivalent_datatype();
        SystemDatatype::new("contiguous", element.extent() * N)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_extents_match_size_of() {
        assert_eq!(f64::equivalent_datatype().extent(), 8);
        assert_eq!(u8::equivalent_datatype().extent(), 1);
        assert_eq!(i32::equivalent_datatype().name(), "i32");
        assert_eq!(
            usize::equivalent_datatype().extent(),
            mem::size_of::<usize>()
        );
    }

    #[test]
    fn array_extent_is_contiguous() {
        let datatype = <[f32; 3]>::equivalent_datatype();
        assert_eq!(datatype.extent(), 12);
        assert_eq!(datatype.extent(), mem::size_of::<[f32; 3]>());
    }

    #[test]
    fn span_detects_overflow() {
        let datatype = u64::equivalent_datatype();
        assert_eq!(datatype.span(10), Some(80));
        assert_eq!(datatype.span(usize::MAX), None);
    }

    #[cfg(feature = "complex")]
    #[test]
    fn complex_extent() {
        assert_eq!(num_complex::Complex64::equivalent_datatype().extent(), 16);
    }
}
