use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Literal that opens a dashboard marker.
pub const DASHBOARD_PREFIX: &str = "[DASHBOARD:";

/// Literal that opens a render marker.
pub const RENDER_PREFIX: &str = "[RENDER:";

/// A structured directive extracted from assistant text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Marker {
    /// Ask the UI to show a dashboard for `intent`.
    Dashboard {
        intent: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// Ask the UI to render a named component with `props`.
    Render { component: String, props: Value },
}

impl Marker {
    /// Outward event name for this marker.
    pub fn kind(&self) -> &'static str {
        match self {
            Marker::Dashboard { .. } => "dashboard",
            Marker::Render { .. } => "render",
        }
    }
}

/// Output of a single interceptor call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Newly confirmed plain text, with markers removed.
    pub text: String,
    /// Markers completed during this call, in order of appearance.
    pub markers: Vec<Marker>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.markers.is_empty()
    }

    /// Append another extraction's output after this one.
    pub fn append(&mut self, other: Extraction) {
        self.text.push_str(&other.text);
        self.markers.extend(other.markers);
    }
}

/// JSON body of a dashboard marker.
#[derive(Deserialize)]
struct DashboardBody {
    intent: String,
    #[serde(default)]
    data: Option<Value>,
}

pub(crate) fn parse_dashboard(body: &str) -> Option<Marker> {
    let parsed: DashboardBody = serde_json::from_str(body).ok()?;
    Some(Marker::Dashboard {
        intent: parsed.intent,
        data: parsed.data,
    })
}

pub(crate) fn parse_render(component: &str, body: &str) -> Option<Marker> {
    let props: Value = serde_json::from_str(body).ok()?;
    Some(Marker::Render {
        component: component.to_string(),
        props,
    })
}
