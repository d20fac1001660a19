//! Core job record model and the raw -> normalized record transformer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobload-core";

/// Origin prepended to the relative job path scraped from LinkedIn.
pub const LINKEDIN_ORIGIN: &str = "https://www.linkedin.com";
pub const ACTIVE_STATUS: &str = "active";
pub const FULL_TIME_JOBTYPE: &str = "Full Time";
pub const HTML_LINE_BREAK: &str = "<br />";

/// Keys the transformer derives itself; pass-through values under these names are dropped.
const DERIVED_KEYS: &[&str] = &[
    "_id",
    "description",
    "userId",
    "userName",
    "status",
    "contact",
    "createdAt",
    "updatedAt",
    "remote",
    "jobtype",
];

/// Job posting as written by the scraper into `jobs.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawJobRecord {
    pub summary: String,
    pub url: String,
    #[serde(rename = "htmlDescription")]
    pub html_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary: Option<JsonValue>,
    #[serde(rename = "isEasyApply", default, skip_serializing_if = "Option::is_none")]
    pub is_easy_apply: Option<JsonValue>,
    /// Every other scraped field, carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Schema-conformant job document, ready for the `jobs` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedJobRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub description: String,
    pub user_id: String,
    pub user_name: String,
    pub status: String,
    pub url: String,
    pub contact: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub html_description: String,
    pub remote: bool,
    pub jobtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// The operator who owns every record written in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorIdentity {
    pub user_id: String,
    pub user_name: String,
}

/// Inputs shared by every record transformed in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformContext {
    pub operator: OperatorIdentity,
    /// Captured once at process start; used for both `createdAt` and `updatedAt`.
    pub timestamp: DateTime<Utc>,
    pub location: Option<String>,
}

/// Source of fresh document identifiers.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

pub fn html_line_breaks(text: &str) -> String {
    text.replace('\n', HTML_LINE_BREAK)
}

pub fn absolute_linkedin_url(path: &str) -> String {
    format!("{LINKEDIN_ORIGIN}{path}")
}

/// Normalize one scraped posting. Total: every step is a rename, a constant,
/// a derived string, or a pass-through.
pub fn transform(
    raw: RawJobRecord,
    ctx: &TransformContext,
    ids: &dyn IdGenerator,
) -> NormalizedJobRecord {
    let RawJobRecord {
        summary,
        url,
        html_description,
        salary: _,
        is_easy_apply: _,
        extra,
    } = raw;

    // Rebuilt rather than removed from so scraped key order survives.
    let extra: Map<String, JsonValue> = extra
        .into_iter()
        .filter(|(key, _)| {
            !DERIVED_KEYS.contains(&key.as_str())
                && !(ctx.location.is_some() && key == "location")
        })
        .collect();

    let url = absolute_linkedin_url(&url);

    NormalizedJobRecord {
        id: ids.next_id(),
        description: summary,
        user_id: ctx.operator.user_id.clone(),
        user_name: ctx.operator.user_name.clone(),
        status: ACTIVE_STATUS.to_string(),
        contact: url.clone(),
        url,
        created_at: ctx.timestamp,
        updated_at: ctx.timestamp,
        html_description: html_line_breaks(&html_description),
        remote: true,
        jobtype: FULL_TIME_JOBTYPE.to_string(),
        location: ctx.location.clone(),
        extra,
    }
}

/// Lazily normalize a stream of scraped postings with a shared context.
pub fn transform_all<'a, I>(
    records: I,
    ctx: &'a TransformContext,
    ids: &'a dyn IdGenerator,
) -> impl Iterator<Item = NormalizedJobRecord> + 'a
where
    I: IntoIterator<Item = RawJobRecord>,
    I::IntoIter: 'a,
{
    records.into_iter().map(move |raw| transform(raw, ctx, ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingIds(AtomicUsize);

    impl IdGenerator for CountingIds {
        fn next_id(&self) -> String {
            format!("id-{}", self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn ctx() -> TransformContext {
        TransformContext {
            operator: OperatorIdentity {
                user_id: "operator-1".into(),
                user_name: "Test Operator".into(),
            },
            timestamp: Utc.with_ymd_and_hms(2026, 10, 17, 9, 30, 0).single().unwrap(),
            location: None,
        }
    }

    fn raw(value: JsonValue) -> RawJobRecord {
        serde_json::from_value(value).expect("raw record")
    }

    fn scenario() -> RawJobRecord {
        raw(json!({
            "summary": "Engineer role",
            "url": "/jobs/42",
            "htmlDescription": "Line1\nLine2",
            "salary": "50k",
            "isEasyApply": true
        }))
    }

    #[test]
    fn scenario_record_is_normalized() {
        let out = transform(scenario(), &ctx(), &CountingIds::default());
        let value = serde_json::to_value(&out).unwrap();

        assert_eq!(value["description"], "Engineer role");
        assert_eq!(value["url"], "https://www.linkedin.com/jobs/42");
        assert_eq!(value["contact"], "https://www.linkedin.com/jobs/42");
        assert_eq!(value["htmlDescription"], "Line1<br />Line2");
        assert_eq!(value["remote"], true);
        assert_eq!(value["jobtype"], "Full Time");
        assert_eq!(value["status"], "active");
        assert_eq!(value["userId"], "operator-1");
        assert_eq!(value["userName"], "Test Operator");
        assert_eq!(value["_id"], "id-0");

        let obj = value.as_object().unwrap();
        for gone in ["summary", "salary", "isEasyApply", "location"] {
            assert!(!obj.contains_key(gone), "{gone} should be absent");
        }
    }

    #[test]
    fn timestamps_share_the_captured_instant() {
        let ctx = ctx();
        let out = transform(scenario(), &ctx, &CountingIds::default());
        assert_eq!(out.created_at, out.updated_at);
        assert_eq!(out.created_at, ctx.timestamp);

        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["createdAt"], value["updatedAt"]);
    }

    #[test]
    fn newlines_become_html_breaks_one_for_one() {
        let input = "a\n\nb\nc\n";
        let record = raw(json!({ "summary": "s", "url": "/x", "htmlDescription": input }));
        let out = transform(record, &ctx(), &CountingIds::default());

        assert!(!out.html_description.contains('\n'));
        assert_eq!(
            out.html_description.matches(HTML_LINE_BREAK).count(),
            input.matches('\n').count()
        );
        assert_eq!(out.html_description, "a<br /><br />b<br />c<br />");
    }

    #[test]
    fn missing_discarded_fields_are_fine() {
        let record = raw(json!({ "summary": "s", "url": "/jobs/1", "htmlDescription": "" }));
        let out = transform(record, &ctx(), &CountingIds::default());
        assert_eq!(out.contact, out.url);
        assert_eq!(out.url, format!("{LINKEDIN_ORIGIN}/jobs/1"));
    }

    #[test]
    fn unrelated_fields_pass_through() {
        let record = raw(json!({
            "summary": "s",
            "url": "/jobs/7",
            "htmlDescription": "h",
            "title": "Rust Engineer",
            "company": "Acme",
            "location": "Morocco",
            "tags": ["remote", "rust"]
        }));
        let out = transform(record, &ctx(), &CountingIds::default());
        let value = serde_json::to_value(&out).unwrap();

        assert_eq!(value["title"], "Rust Engineer");
        assert_eq!(value["company"], "Acme");
        assert_eq!(value["location"], "Morocco");
        assert_eq!(value["tags"], json!(["remote", "rust"]));
    }

    #[test]
    fn pass_through_keys_keep_scraped_order() {
        let record = raw(json!({
            "zeta": 1,
            "summary": "s",
            "alpha": 2,
            "url": "/jobs/5",
            "status": "closed",
            "mid": 3,
            "htmlDescription": "h"
        }));
        let out = transform(record, &ctx(), &CountingIds::default());

        let keys: Vec<&str> = out.extra.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);

        let value = serde_json::to_value(&out).unwrap();
        let tail: Vec<&str> = value
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .skip_while(|k| *k != "zeta")
            .collect();
        assert_eq!(tail, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn derived_keys_win_over_scraped_ones() {
        let record = raw(json!({
            "summary": "from summary",
            "url": "/jobs/9",
            "htmlDescription": "h",
            "description": "stale",
            "_id": "scraped-id",
            "status": "closed",
            "remote": false
        }));
        let out = transform(record, &ctx(), &CountingIds::default());
        let value = serde_json::to_value(&out).unwrap();

        assert_eq!(value["description"], "from summary");
        assert_eq!(value["_id"], "id-0");
        assert_eq!(value["status"], "active");
        assert_eq!(value["remote"], true);
        assert!(out.extra.is_empty());
    }

    #[test]
    fn location_flag_overrides_scraped_location() {
        let mut ctx = ctx();
        ctx.location = Some("Casablanca".into());
        let record = raw(json!({
            "summary": "s",
            "url": "/jobs/3",
            "htmlDescription": "h",
            "location": "Morocco"
        }));
        let out = transform(record, &ctx, &CountingIds::default());
        let value = serde_json::to_value(&out).unwrap();

        assert_eq!(value["location"], "Casablanca");
        assert!(!out.extra.contains_key("location"));
    }

    #[test]
    fn ids_are_unique_across_calls() {
        let ids = UuidIdGenerator;
        let ctx = ctx();
        let seen: HashSet<String> = (0..64)
            .map(|_| transform(scenario(), &ctx, &ids).id)
            .collect();
        assert_eq!(seen.len(), 64);
        assert!(seen.iter().all(|id| !id.is_empty()));
    }

    #[test]
    fn repeated_runs_differ_only_in_id_and_time() {
        let ids = UuidIdGenerator;
        let first = transform(scenario(), &ctx(), &ids);
        let mut later_ctx = ctx();
        later_ctx.timestamp = later_ctx.timestamp + chrono::Duration::minutes(5);
        let second = transform(scenario(), &later_ctx, &ids);

        assert_ne!(first.id, second.id);
        assert_ne!(first.created_at, second.created_at);
        let aligned = NormalizedJobRecord {
            id: first.id.clone(),
            created_at: first.created_at,
            updated_at: first.updated_at,
            ..second
        };
        assert_eq!(aligned, first);
    }

    #[test]
    fn transform_all_is_lazy_and_ordered() {
        let ids = CountingIds::default();
        let ctx = ctx();
        let records = vec![scenario(), scenario(), scenario()];
        let mut iter = transform_all(records, &ctx, &ids);

        assert_eq!(ids.0.load(Ordering::SeqCst), 0);
        assert_eq!(iter.next().map(|r| r.id), Some("id-0".to_string()));
        assert_eq!(iter.map(|r| r.id).collect::<Vec<_>>(), vec!["id-1", "id-2"]);
    }

    #[test]
    fn missing_summary_is_rejected_at_parse_time() {
        let err = serde_json::from_value::<RawJobRecord>(json!({
            "url": "/jobs/1",
            "htmlDescription": "h"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("summary"));
    }
}
