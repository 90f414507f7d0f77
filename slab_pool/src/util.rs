use std::fmt::{self, Debug};

/// Divide, rounding up
pub const fn divroundup(num: usize, divisor: usize) -> usize {
    num.div_ceil(divisor)
}

/// Round `num` up to the next multiple of `multiple`
pub const fn roundto(num: usize, multiple: usize) -> usize {
    divroundup(num, multiple) * multiple
}

/// [roundto], or `None` if the result doesn't fit in a usize
pub const fn checked_roundto(num: usize, multiple: usize) -> Option<usize> {
    divroundup(num, multiple).checked_mul(multiple)
}

/// Wrapper that prints a pointer as hex in tracing fields
/// (without requiring the pointee to be `Debug` or `Send`)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UsizePtr(pub usize);

impl Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl<T: ?Sized> From<*const T> for UsizePtr {
    fn from(value: *const T) -> Self {
        Self(value as *const () as usize)
    }
}

impl<T: ?Sized> From<*mut T> for UsizePtr {
    fn from(value: *mut T) -> Self {
        Self(value as *const () as usize)
    }
}

impl<T: ?Sized> From<&T> for UsizePtr {
    fn from(value: &T) -> Self {
        Self(value as *const T as *const () as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divroundup_test() {
        assert_eq!(divroundup(0, 4), 0);
        assert_eq!(divroundup(4, 4), 1);
        assert_eq!(divroundup(5, 4), 2);
        assert_eq!(divroundup(usize::MAX, 8), usize::MAX / 8 + 1);
        assert_eq!(divroundup(usize::MAX, 1), usize::MAX);
    }

    #[test]
    fn roundto_test() {
        assert_eq!(roundto(0, 8), 0);
        assert_eq!(roundto(1, 8), 8);
        assert_eq!(roundto(8, 8), 8);
        assert_eq!(roundto(9, 8), 16);
        assert_eq!(roundto(511, 8), 512);
    }

    #[test]
    fn checked_roundto_test() {
        assert_eq!(checked_roundto(9, 8), Some(16));
        assert_eq!(checked_roundto(usize::MAX - 7, 8), Some(usize::MAX - 7));
        assert_eq!(checked_roundto(usize::MAX - 3, 8), None);
        assert_eq!(checked_roundto(usize::MAX, 8), None);
    }

    #[test]
    fn usize_ptr_debug() {
        let p = 0x1234usize as *const u8;
        assert_eq!(format!("{:?}", UsizePtr::from(p)), "0x1234");
        let x = 5u64;
        assert_eq!(UsizePtr::from(&x).0, &x as *const u64 as usize);
    }
}
