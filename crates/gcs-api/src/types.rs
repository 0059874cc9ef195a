use serde::Serialize;

// ── Bucket types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateBucketRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Lifecycle {
    pub rule: Vec<LifecycleRule>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleRule {
    pub action: LifecycleAction,
    pub condition: LifecycleCondition,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleAction {
    #[serde(rename = "type")]
    pub action_kind: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleCondition {
    pub age: u32,
}

impl LifecycleRule {
    /// A rule deleting objects older than `age_days` days.
    pub fn delete_after_days(age_days: u32) -> Self {
        Self {
            action: LifecycleAction { action_kind: "Delete".into() },
            condition: LifecycleCondition { age: age_days },
        }
    }
}
