use chrono::{DateTime, Utc};

use crate::model::Message;

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 100;

/// Out-of-range or absent limits fall back to the default page size.
pub fn normalize_limit(requested: Option<i64>) -> usize {
    match requested {
        Some(limit) if limit > 0 && limit <= MAX_HISTORY_LIMIT as i64 => limit as usize,
        _ => DEFAULT_HISTORY_LIMIT,
    }
}

/// Select one page of history: newest first, strictly older than `before`.
///
/// Ties on `created_at` are ordered by id, descending, matching the storage
/// query so both backends page identically.
pub fn page_newest_first<I>(messages: I, before: Option<DateTime<Utc>>, limit: usize) -> Vec<Message>
where
    I: IntoIterator<Item = Message>,
{
    let mut page: Vec<Message> = messages
        .into_iter()
        .filter(|message| before.map_or(true, |cursor| message.created_at < cursor))
        .collect();
    page.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    page.truncate(limit);
    page
}
