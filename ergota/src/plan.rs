//! Chunking and flow-control planning.
//!
//! The firmware image is cut into packages of at most `attr` bytes; only the
//! last package may be shorter. Packages are grouped into windows of
//! `floor(buffer / attr)` packages (at least one), and the device acknowledges
//! once per window.
//!
//! ```text
//! image  |---------------------------------------------------------|
//! pkgs   |  p0  |  p1  |  p2  |  p3  |  p4  |  p5  |  p6  |  p7  |p8|
//! window |        w0          |        w1          |      w2       |
//! ```
//!
//! The plan only depends on `(image_len, attr, buffer)`.

use std::ops::Range;

/// Partition of an image into windows of packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    image_len: usize,
    attr: usize,
    packages_per_window: usize,
}

impl TransferPlan {
    /// Plan the transfer of `image_len` bytes.
    ///
    /// Returns `None` if `attr` is zero, since no package could carry data.
    pub fn new(image_len: usize, attr: u32, buffer: u32) -> Option<Self> {
        if attr == 0 {
            return None;
        }
        let attr = attr as usize;
        let packages_per_window = (buffer as usize / attr).max(1);

        Some(Self {
            image_len,
            attr,
            packages_per_window,
        })
    }

    /// Image length in bytes.
    pub fn image_len(&self) -> usize {
        self.image_len
    }

    /// Maximum payload per package.
    pub fn attr(&self) -> usize {
        self.attr
    }

    /// Packages per full window.
    pub fn packages_per_window(&self) -> usize {
        self.packages_per_window
    }

    /// Bytes carried by a full window.
    pub fn window_bytes(&self) -> usize {
        self.attr * self.packages_per_window
    }

    /// Total number of Package frames.
    pub fn package_count(&self) -> usize {
        self.image_len.div_ceil(self.attr)
    }

    /// Total number of windows.
    pub fn window_count(&self) -> usize {
        self.image_len.div_ceil(self.window_bytes())
    }

    /// Iterate over the windows in transfer order.
    pub fn windows(&self) -> Windows {
        Windows {
            plan: *self,
            offset: 0,
            index: 0,
        }
    }
}

/// One batch of packages sent before waiting for an acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// Position of the window in the transfer.
    pub index: usize,
    /// Byte range of the image covered by the window.
    pub bytes: Range<usize>,
    attr: usize,
    last: bool,
}

impl Window {
    /// Whether this is the final window of the image.
    ///
    /// The device does not acknowledge the final window; End follows directly.
    pub fn is_last(&self) -> bool {
        self.last
    }

    /// Number of packages in the window.
    pub fn package_count(&self) -> usize {
        self.bytes.len().div_ceil(self.attr)
    }

    /// Payloads of the window's packages, in order.
    pub fn packages<'a>(&self, image: &'a [u8]) -> std::slice::Chunks<'a, u8> {
        image[self.bytes.clone()].chunks(self.attr)
    }
}

/// Iterator over the windows of a [`TransferPlan`].
#[derive(Debug, Clone)]
pub struct Windows {
    plan: TransferPlan,
    offset: usize,
    index: usize,
}

impl Iterator for Windows {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        if self.offset >= self.plan.image_len {
            return None;
        }

        let end = (self.offset + self.plan.window_bytes()).min(self.plan.image_len);
        let window = Window {
            index: self.index,
            bytes: self.offset..end,
            attr: self.plan.attr,
            last: end == self.plan.image_len,
        };

        self.offset = end;
        self.index += 1;
        Some(window)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.plan.image_len - self.offset.min(self.plan.image_len))
            .div_ceil(self.plan.window_bytes());
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Windows {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_attr_has_no_plan() {
        assert!(TransferPlan::new(100, 0, 100).is_none());
    }

    #[test]
    fn test_package_count_is_ceiling() {
        let plan = TransferPlan::new(100, 15, 45).unwrap();
        assert_eq!(plan.package_count(), 7);

        let plan = TransferPlan::new(1024, 15, 100).unwrap();
        assert_eq!(plan.package_count(), 69);

        let plan = TransferPlan::new(90, 15, 45).unwrap();
        assert_eq!(plan.package_count(), 6);
    }

    #[test]
    fn test_window_sizing() {
        let plan = TransferPlan::new(95, 10, 30).unwrap();
        let counts: Vec<usize> = plan.windows().map(|w| w.package_count()).collect();
        assert_eq!(counts, vec![3, 3, 3, 1]);
        assert_eq!(plan.window_count(), 4);
    }

    #[test]
    fn test_non_multiple_buffer_floors() {
        // 100 / 15 = 6 packages per window
        let plan = TransferPlan::new(1024, 15, 100).unwrap();
        assert_eq!(plan.packages_per_window(), 6);
        assert_eq!(plan.window_bytes(), 90);
        assert_eq!(plan.window_count(), 12);
    }

    #[test]
    fn test_buffer_smaller_than_attr_keeps_one_package() {
        let plan = TransferPlan::new(50, 20, 5).unwrap();
        assert_eq!(plan.packages_per_window(), 1);
        assert_eq!(plan.window_count(), 3);
    }

    #[test]
    fn test_windows_cover_image_exactly() {
        let plan = TransferPlan::new(1024, 15, 100).unwrap();
        let windows: Vec<Window> = plan.windows().collect();

        assert_eq!(windows.first().unwrap().bytes.start, 0);
        assert_eq!(windows.last().unwrap().bytes.end, 1024);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].bytes.end, pair[1].bytes.start);
        }
        assert_eq!(windows.iter().filter(|w| w.is_last()).count(), 1);
        assert!(windows.last().unwrap().is_last());
    }

    #[test]
    fn test_packages_respect_attr() {
        let image: Vec<u8> = (0..=255).cycle().take(1024).collect();
        let plan = TransferPlan::new(image.len(), 15, 100).unwrap();

        let mut rebuilt = Vec::new();
        let mut count = 0;
        for window in plan.windows() {
            for package in window.packages(&image) {
                assert!(!package.is_empty());
                assert!(package.len() <= 15);
                rebuilt.extend_from_slice(package);
                count += 1;
            }
        }
        assert_eq!(count, 69);
        assert_eq!(rebuilt, image);
    }

    #[test]
    fn test_last_package_may_be_short() {
        let image = vec![0u8; 100];
        let plan = TransferPlan::new(image.len(), 15, 45).unwrap();
        let last = plan.windows().last().unwrap();
        assert_eq!(last.packages(&image).last().unwrap().len(), 10);
    }

    #[test]
    fn test_empty_image_has_no_windows() {
        let plan = TransferPlan::new(0, 15, 100).unwrap();
        assert_eq!(plan.package_count(), 0);
        assert_eq!(plan.window_count(), 0);
        assert_eq!(plan.windows().count(), 0);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let a: Vec<Window> = TransferPlan::new(777, 13, 64).unwrap().windows().collect();
        let b: Vec<Window> = TransferPlan::new(777, 13, 64).unwrap().windows().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_windows_size_hint() {
        let plan = TransferPlan::new(95, 10, 30).unwrap();
        let mut windows = plan.windows();
        assert_eq!(windows.len(), 4);
        windows.next();
        assert_eq!(windows.len(), 3);
    }
}
