//! 任务与Redis hash之间的转换
//!
//! 标量字段以原始字符串保存，供Lua脚本直接读取；
//! 结构化字段（options、parameters、notification、children）以JSON保存。
//! `update` 只写入副本改过的字段（见 [`encode_changes`]），不同字段的写入互不覆盖。

use std::collections::HashMap;

use chrono::DateTime;
use jobqueue_core::{JobQueueError, JobQueueResult, Task, TaskDocument, TaskField};

use super::keys::ready_entry;

pub const FIELD_STATUS: &str = "status";
pub const FIELD_PROFILE: &str = "profile";
pub const FIELD_RANK: &str = "rank";
pub const FIELD_SCHEDULED_AT: &str = "scheduled_at";

pub fn encode(task: &Task) -> JobQueueResult<Vec<(&'static str, String)>> {
    let doc = task.export();
    let optional = |value: Option<i64>| value.map(|v| v.to_string()).unwrap_or_default();

    Ok(vec![
        ("id", optional(doc.id)),
        ("tag", doc.tag),
        ("parent_id", optional(doc.parent_id)),
        ("job", doc.job),
        (FIELD_STATUS, doc.status.to_string()),
        ("progress", doc.progress.to_string()),
        ("created_at", doc.created_at.timestamp().to_string()),
        (
            FIELD_SCHEDULED_AT,
            optional(doc.scheduled_at.map(|at| at.timestamp())),
        ),
        ("options", serde_json::to_string(&doc.options)?),
        ("parameters", serde_json::to_string(&doc.parameters)?),
        (
            "notification",
            match &doc.notification {
                Some(notification) => serde_json::to_string(notification)?,
                None => String::new(),
            },
        ),
        ("children", serde_json::to_string(&doc.children)?),
        (FIELD_PROFILE, task.profile().to_string()),
        (
            FIELD_RANK,
            ready_entry(
                task.priority(),
                doc.created_at.timestamp(),
                doc.id.unwrap_or_default(),
            ),
        ),
    ])
}

/// 只编码相对基线改过的字段
///
/// `profile` 和 `rank` 由 options 派生，options 改变时一并写入。
pub fn encode_changes(task: &Task) -> JobQueueResult<Vec<(&'static str, String)>> {
    let changed = task.changed_fields();
    let options_changed = changed.contains(&TaskField::Options);

    Ok(encode(task)?
        .into_iter()
        .filter(|(name, _)| {
            changed.iter().any(|field| field.name() == *name)
                || (options_changed && (*name == FIELD_PROFILE || *name == FIELD_RANK))
        })
        .collect())
}

pub fn decode(mut fields: HashMap<String, String>) -> JobQueueResult<Task> {
    let mut take = |name: &str| fields.remove(name).unwrap_or_default();

    let id = parse_optional_i64("id", &take("id"))?;
    let tag = take("tag");
    let parent_id = parse_optional_i64("parent_id", &take("parent_id"))?;
    let job = take("job");
    let status = take(FIELD_STATUS).parse()?;
    let progress = take("progress")
        .parse::<f64>()
        .map_err(|e| JobQueueError::Serialization(format!("progress: {e}")))?;
    let created_at = timestamp("created_at", Some(parse_i64("created_at", &take("created_at"))?))?
        .unwrap_or_default();
    let scheduled_at = timestamp(
        FIELD_SCHEDULED_AT,
        parse_optional_i64(FIELD_SCHEDULED_AT, &take(FIELD_SCHEDULED_AT))?,
    )?;
    let options = json_or_default(&take("options"))?;
    let parameters = json_or_default(&take("parameters"))?;
    let notification = match take("notification").as_str() {
        "" => None,
        raw => Some(serde_json::from_str(raw)?),
    };
    let children = json_or_default(&take("children"))?;

    Task::try_from(TaskDocument {
        id,
        tag,
        parent_id,
        job,
        status,
        progress,
        created_at,
        scheduled_at,
        options,
        parameters,
        notification,
        children,
    })
}

fn parse_i64(field: &str, raw: &str) -> JobQueueResult<i64> {
    raw.parse()
        .map_err(|e| JobQueueError::Serialization(format!("{field}: {e}")))
}

fn parse_optional_i64(field: &str, raw: &str) -> JobQueueResult<Option<i64>> {
    if raw.is_empty() {
        Ok(None)
    } else {
        parse_i64(field, raw).map(Some)
    }
}

fn timestamp(field: &str, secs: Option<i64>) -> JobQueueResult<Option<DateTime<chrono::Utc>>> {
    match secs {
        None => Ok(None),
        Some(secs) => DateTime::from_timestamp(secs, 0)
            .map(Some)
            .ok_or_else(|| JobQueueError::Serialization(format!("{field}: 无效的时间戳 {secs}"))),
    }
}

fn json_or_default<T: serde::de::DeserializeOwned + Default>(raw: &str) -> JobQueueResult<T> {
    if raw.is_empty() {
        Ok(T::default())
    } else {
        Ok(serde_json::from_str(raw)?)
    }
}
