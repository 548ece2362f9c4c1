use chrono::{Datelike, NaiveDate};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::Validation(msg.into())
}

/// Inclusive date range of a capacity window or allocation.
pub(crate) fn validate_range(start: NaiveDate, end: NaiveDate) -> Result<Span, EngineError> {
    check_year(start)?;
    check_year(end)?;
    if start > end {
        return Err(invalid(format!("start {start} is after end {end}")));
    }
    let span = Span::inclusive(start, end);
    if span.days() > MAX_SPAN_DAYS {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    Ok(span)
}

/// Inclusive query window for conflict and utilization views.
pub(crate) fn validate_window(start: NaiveDate, end: NaiveDate) -> Result<Span, EngineError> {
    check_year(start)?;
    check_year(end)?;
    if start > end {
        return Err(invalid(format!("window start {start} is after end {end}")));
    }
    let span = Span::inclusive(start, end);
    if span.days() > MAX_QUERY_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(span)
}

fn check_year(date: NaiveDate) -> Result<(), EngineError> {
    if !(MIN_VALID_YEAR..=MAX_VALID_YEAR).contains(&date.year()) {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    Ok(())
}

fn required_text(field: &str, value: &str, max: usize, limit: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(invalid(format!("{field} must not be empty")));
    }
    if value.len() > max {
        return Err(EngineError::LimitExceeded(limit));
    }
    Ok(())
}

fn tags(field: &str, values: &[String]) -> Result<(), EngineError> {
    if values.len() > MAX_TAGS {
        return Err(EngineError::LimitExceeded("too many tags"));
    }
    for v in values {
        required_text(field, v, MAX_TAG_LEN, "tag too long")?;
    }
    Ok(())
}

fn quantity(q: Qty) -> Result<(), EngineError> {
    if q > MAX_QUANTITY {
        return Err(EngineError::LimitExceeded("quantity too large"));
    }
    Ok(())
}

fn reference(field: &str, value: &str) -> Result<(), EngineError> {
    required_text(field, value, MAX_REFERENCE_LEN, "reference too long")
}

fn notes(value: Option<&str>) -> Result<(), EngineError> {
    if value.is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

pub(crate) fn validate_resource(r: &Resource) -> Result<(), EngineError> {
    required_text("name", &r.name, MAX_NAME_LEN, "resource name too long")?;
    required_text("code", &r.code, MAX_CODE_LEN, "resource code too long")?;
    tags("skill", &r.skills)?;
    tags("certification", &r.certifications)?;
    if let Some(cost) = &r.cost {
        if !cost.rate.is_finite() || cost.rate < 0.0 {
            return Err(invalid(format!("cost rate must be a finite non-negative number, got {}", cost.rate)));
        }
        let currency = cost.currency.trim();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(invalid(format!("currency must be a 3-letter code, got {:?}", cost.currency)));
        }
    }
    if let Some(s) = &r.schedule {
        if s.weekdays == 0 || s.weekdays > 0b111_1111 {
            return Err(invalid("work schedule weekday mask must select 1-7 days"));
        }
        if s.start_hour >= s.end_hour || s.end_hour > 24 {
            return Err(invalid(format!(
                "work schedule hours must satisfy 0 <= start < end <= 24, got {}..{}",
                s.start_hour, s.end_hour
            )));
        }
    }
    Ok(())
}

pub(crate) fn validate_capacity(c: &ResourceCapacity) -> Result<Span, EngineError> {
    let span = validate_range(c.start, c.end)?;
    quantity(c.quantity)?;
    required_text("unit", &c.unit, MAX_UNIT_LEN, "unit too long")?;
    Ok(span)
}

pub(crate) fn validate_allocation(a: &ResourceAllocation) -> Result<Span, EngineError> {
    let span = validate_range(a.start, a.end)?;
    if a.quantity == 0 {
        return Err(invalid("allocation quantity must be positive"));
    }
    quantity(a.quantity)?;
    reference("project_id", &a.project_id)?;
    if let Some(task) = &a.task_id {
        reference("task_id", task)?;
    }
    notes(a.notes.as_deref())?;
    Ok(span)
}

pub(crate) fn validate_pending(index: usize, r: &PendingRequest) -> Result<Span, EngineError> {
    let span = validate_range(r.start, r.end)
        .map_err(|e| match e {
            EngineError::Validation(msg) => invalid(format!("request {index}: {msg}")),
            other => other,
        })?;
    if r.quantity == 0 {
        return Err(invalid(format!("request {index}: quantity must be positive")));
    }
    quantity(r.quantity)?;
    if let Some(task) = &r.task_id {
        reference("task_id", task)?;
    }
    notes(r.notes.as_deref())?;
    Ok(span)
}

pub(crate) fn validate_search(query: &str) -> Result<(), EngineError> {
    if query.len() > MAX_SEARCH_LEN {
        return Err(EngineError::LimitExceeded("search query too long"));
    }
    Ok(())
}

pub(crate) fn validate_project(project_id: &str) -> Result<(), EngineError> {
    reference("project_id", project_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn range_rejects_reversed_dates() {
        let err = validate_range(d(2024, 1, 10), d(2024, 1, 9)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(validate_range(d(2024, 1, 9), d(2024, 1, 9)).unwrap().days(), 1);
    }

    #[test]
    fn range_rejects_out_of_range_years() {
        assert!(matches!(
            validate_range(d(1800, 1, 1), d(2024, 1, 1)),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn window_width_is_limited() {
        assert!(matches!(
            validate_window(d(1950, 1, 1), d(2024, 1, 1)),
            Err(EngineError::LimitExceeded("query window too wide"))
        ));
        assert!(validate_window(d(2024, 1, 1), d(2024, 12, 31)).is_ok());
    }

    #[test]
    fn pending_request_needs_positive_quantity() {
        let r = PendingRequest::new(ulid::Ulid::nil(), d(2024, 1, 1), d(2024, 1, 2), 0, Priority::Low);
        let err = validate_pending(4, &r).unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref m) if m.starts_with("request 4")));
    }
}
