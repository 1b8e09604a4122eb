/// Byte range of a sub-resource. `end` is inclusive, `None` means "to the end of the resource".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Whether this range covers the whole resource, so no `Range` header is needed.
    pub fn is_full(&self) -> bool {
        self.start == 0 && self.end.is_none()
    }

    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start) + 1)
    }

    pub fn to_http_range(&self) -> String {
        if let Some(end) = self.end {
            format!("bytes={}-{}", self.start, end)
        } else {
            format!("bytes={}-", self.start)
        }
    }
}
