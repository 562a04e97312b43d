use crate::error::StoreError;
use crate::model::*;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), StoreError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(StoreError::InvalidSpan(*span));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(StoreError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(StoreError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Rooms hold one appointment at a time; tentative offers block like confirmed ones.
pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    span: &Span,
    ignore: Option<ulid::Ulid>,
) -> Result<(), StoreError> {
    match rs.overlapping(span).find(|a| Some(a.id) != ignore) {
        Some(existing) => Err(StoreError::Conflict {
            resource_id: rs.id,
            existing: existing.id,
        }),
        None => Ok(()),
    }
}

pub(crate) fn validate_text(title: &str, description: &str) -> Result<(), StoreError> {
    use crate::limits::*;
    if title.len() > MAX_TITLE_LEN {
        return Err(StoreError::LimitExceeded("title too long"));
    }
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(StoreError::LimitExceeded("description too long"));
    }
    Ok(())
}
