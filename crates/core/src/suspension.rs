use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::policy::HandlerName;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionKind {
    /// The end user must confirm a charge against their own account.
    Confirmation,
    /// A manager must approve a privileged record mutation.
    Approval,
}

impl SuspensionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmation => "confirmation",
            Self::Approval => "approval",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "confirmation" => Some(Self::Confirmation),
            "approval" => Some(Self::Approval),
            _ => None,
        }
    }
}

/// A parked request for external human input, installed by a handler
/// immediately before an irreversible effect.
///
/// At most one suspension may be pending per conversation. `args` carries the
/// values captured during the read-only prepare phase (price, old/new totals,
/// billing snapshot); the commit step reports those captured values rather
/// than re-reading them, so the receipt always matches what was approved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Suspension {
    pub kind: SuspensionKind,
    /// Handler that owns the commit step for `action`.
    pub handler: HandlerName,
    pub action: String,
    pub args: Map<String, Value>,
    pub prompt: String,
}

impl Suspension {
    pub fn matches(&self, resolution: &Resolution) -> bool {
        self.kind == resolution.kind()
    }

    pub fn arg_i64(&self, key: &str) -> Option<i64> {
        self.args.get(key).and_then(Value::as_i64)
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

/// The external answer that unblocks a [`Suspension`]. Consumed exactly once;
/// the wire shape (`{"confirmed": ...}` vs `{"approved": ...}`) encodes which
/// kind of suspension it resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Resolution {
    Confirmation { confirmed: bool },
    Approval { approved: bool },
}

impl Resolution {
    pub fn kind(&self) -> SuspensionKind {
        match self {
            Self::Confirmation { .. } => SuspensionKind::Confirmation,
            Self::Approval { .. } => SuspensionKind::Approval,
        }
    }

    pub fn accepted(&self) -> bool {
        match self {
            Self::Confirmation { confirmed } => *confirmed,
            Self::Approval { approved } => *approved,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::{Resolution, Suspension, SuspensionKind};
    use crate::policy::HandlerName;

    fn purchase_suspension() -> Suspension {
        let mut args = Map::new();
        args.insert("track_id".to_string(), json!(7));
        args.insert("price".to_string(), json!("0.99"));
        Suspension {
            kind: SuspensionKind::Confirmation,
            handler: HandlerName::Storefront,
            action: "purchase_track".to_string(),
            args,
            prompt: "Confirm purchase of \"Track 7\" for $0.99?".to_string(),
        }
    }

    #[test]
    fn resolution_kind_must_match_suspension_kind() {
        let suspension = purchase_suspension();
        assert!(suspension.matches(&Resolution::Confirmation { confirmed: true }));
        assert!(!suspension.matches(&Resolution::Approval { approved: true }));
    }

    #[test]
    fn wire_shape_selects_the_variant() {
        let confirmation: Resolution = serde_json::from_str(r#"{"confirmed": false}"#).unwrap();
        assert_eq!(confirmation, Resolution::Confirmation { confirmed: false });
        assert!(!confirmation.accepted());

        let approval: Resolution = serde_json::from_str(r#"{"approved": true}"#).unwrap();
        assert_eq!(approval, Resolution::Approval { approved: true });
        assert!(approval.accepted());
    }

    #[test]
    fn captured_args_are_readable_by_key() {
        let suspension = purchase_suspension();
        assert_eq!(suspension.arg_i64("track_id"), Some(7));
        assert_eq!(suspension.arg_str("price"), Some("0.99"));
        assert_eq!(suspension.arg_i64("album_id"), None);
    }
}
