use crate::marker::{DASHBOARD_PREFIX, Extraction, RENDER_PREFIX};
use crate::scan::{Scan, find_prefix, partial_prefix_len, scan_marker};

/// Stateful scanner that separates prose from inline markers across fragments.
///
/// The only state carried between calls is the unconsumed tail of the input.
/// Each call rescans that tail from its start, so callers never track offsets.
#[derive(Debug, Default, Clone)]
pub struct MarkerInterceptor {
    buffer: String,
}

impl MarkerInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next fragment and return whatever it confirmed.
    pub fn add_chunk(&mut self, chunk: &str) -> Extraction {
        self.buffer.push_str(chunk);
        self.extract()
    }

    /// Settle everything still buffered. No more fragments are expected.
    ///
    /// An unfinished marker can no longer complete, so its literal prefix is
    /// released as text and the rest is scanned again; a marker that starts
    /// inside an abandoned one is still honored.
    pub fn flush(&mut self) -> Extraction {
        let mut out = self.extract();
        while !self.buffer.is_empty() {
            let release = if self.buffer.starts_with(DASHBOARD_PREFIX) {
                DASHBOARD_PREFIX.len()
            } else if self.buffer.starts_with(RENDER_PREFIX) {
                RENDER_PREFIX.len()
            } else {
                self.buffer.len()
            };
            out.text.push_str(&self.buffer[..release]);
            self.buffer.drain(..release);
            out.append(self.extract());
        }
        out
    }

    /// Text currently withheld because it may still become a marker.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty()
    }

    fn extract(&mut self) -> Extraction {
        let mut out = Extraction::default();
        let mut cursor = 0;

        loop {
            let rest = &self.buffer[cursor..];
            let Some((offset, kind)) = find_prefix(rest) else {
                let emit = rest.len() - partial_prefix_len(rest);
                out.text.push_str(&rest[..emit]);
                cursor += emit;
                break;
            };

            out.text.push_str(&rest[..offset]);
            let start = cursor + offset;
            match scan_marker(&self.buffer[start..], kind) {
                Scan::Incomplete => {
                    cursor = start;
                    break;
                }
                Scan::Complete { marker, len } => {
                    out.markers.push(marker);
                    cursor = start + len;
                }
                Scan::Malformed { len } => {
                    debug_assert!(len >= kind.prefix().len());
                    out.text.push_str(&self.buffer[start..start + len]);
                    cursor = start + len;
                }
            }
        }

        self.buffer.drain(..cursor);
        out
    }
}

/// Run a complete message through a fresh interceptor.
pub fn extract_all(text: &str) -> Extraction {
    let mut interceptor = MarkerInterceptor::new();
    let mut out = interceptor.add_chunk(text);
    out.append(interceptor.flush());
    out
}
