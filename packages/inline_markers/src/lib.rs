//! Inline Markers - streaming extraction of UI directives from assistant text
//!
//! Assistant replies may embed two bracketed directives inline with prose:
//!
//! - `[DASHBOARD:{"intent":"contacts","data":{...}}]`
//! - `[RENDER:componentName:{...}]`
//!
//! [`MarkerInterceptor`] consumes text fragments as they stream in, returns the
//! prose with the directives removed, and hands the directives back as
//! structured [`Marker`] values. Fragment boundaries can fall anywhere, including
//! in the middle of a marker literal; text that might still turn into a marker
//! is withheld until the next fragment (or [`MarkerInterceptor::flush`]) settles it.
//!
//! The interceptor never fails. A marker that does not parse is passed through
//! verbatim as text.
//!
//! # Example
//!
//! ```
//! use inline_markers::{Marker, MarkerInterceptor};
//!
//! let mut interceptor = MarkerInterceptor::new();
//! let first = interceptor.add_chunk("Here you go [DASH");
//! assert_eq!(first.text, "Here you go ");
//!
//! let second = interceptor.add_chunk(r#"BOARD:{"intent":"contacts"}] done"#);
//! assert_eq!(second.text, " done");
//! assert_eq!(
//!     second.markers,
//!     vec![Marker::Dashboard { intent: "contacts".into(), data: None }]
//! );
//! ```

mod interceptor;
mod marker;
mod scan;

pub use interceptor::{MarkerInterceptor, extract_all};
pub use marker::{DASHBOARD_PREFIX, Extraction, Marker, RENDER_PREFIX};
