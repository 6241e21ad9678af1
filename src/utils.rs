use std::{fmt, mem::size_of};

pub mod env;

pub const fn is_power_of_two(x: usize) -> bool {
    x != 0 && (x & (x - 1)) == 0
}

pub fn is_aligned(x: usize, alignment: usize, offset: usize) -> bool {
    debug_assert!(is_power_of_two(alignment));
    debug_assert!(offset < alignment);
    (x & (alignment - 1)) == offset
}

pub const fn round_down(x: usize, alignment: usize) -> usize {
    x & !(alignment.wrapping_sub(1))
}

pub fn round_up(x: usize, alignment: usize, offset: usize) -> usize {
    debug_assert!(offset < alignment);
    round_down(x + alignment - 1 + offset, alignment) - offset
}

pub const fn round_up_to_word(bytes: usize) -> usize {
    (bytes + size_of::<usize>() - 1) / size_of::<usize>()
}

/// Byte count rendered with a binary unit, e.g. `1.5M`.
#[derive(Clone, Copy)]
pub struct FormattedSize(usize);

impl fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 3] = ["K", "M", "G"];
        if self.0 < 1024 {
            return write!(f, "{}B", self.0);
        }
        let mut size = self.0 as f64 / 1024.0;
        let mut unit = 0;
        while size >= 1024.0 && unit + 1 < UNITS.len() {
            size /= 1024.0;
            unit += 1;
        }
        write!(f, "{:.1}{}", size, UNITS[unit])
    }
}

impl fmt::Debug for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_up(13, 8, 0), 16);
        assert_eq!(round_up(16, 8, 0), 16);
        assert_eq!(round_down(4097, 4096), 4096);
        assert_eq!(round_up_to_word(1), 1);
        assert_eq!(round_up_to_word(0), 0);
        assert!(is_aligned(64, 16, 0));
        assert!(!is_aligned(66, 16, 0));
        assert!(is_power_of_two(1 << 20));
        assert!(!is_power_of_two(0));
    }

    #[test]
    fn size_formatting() {
        assert_eq!(formatted_size(512).to_string(), "512B");
        assert_eq!(formatted_size(2048).to_string(), "2.0K");
        assert_eq!(formatted_size(3 * 1024 * 1024).to_string(), "3.0M");
        assert_eq!(formatted_size(5 << 30).to_string(), "5.0G");
    }
}
