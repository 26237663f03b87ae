//! Receipt PDF parsing, per spec.md §4.9.1.
//!
//! Input is raw extracted text with lines preserved. Two bank-receipt
//! templates are recognized: "columnar" (every label appears as its own
//! contiguous block of lines, followed by a contiguous block of values in
//! the same order) and "sequential" (each line is `label: value`, or a
//! label line immediately followed by its value line). Detection looks at
//! whether the first `LABELS.len()` lines are all label lines with no
//! attached value -- if so it's columnar, otherwise sequential.

use async_trait::async_trait;
use model::{Money, ReceiptFields};
use time::OffsetDateTime;

use crate::errors::ReceiptParseError;

pub type Result<T> = std::result::Result<T, ReceiptParseError>;

/// Field name, recognized label variants (lowercased, no trailing colon).
const LABELS: &[(&str, &[&str])] = &[
    ("datetime", &["дата и время", "дата и время операции"]),
    ("total", &["сумма"]),
    ("amount", &["сумма перевода", "сумма зачисления"]),
    ("commission", &["комиссия"]),
    ("status", &["статус"]),
    ("transfer_type", &["тип операции", "тип перевода"]),
    ("sender_name", &["отправитель", "фио отправителя"]),
    ("sender_account", &["счет списания", "счёт списания"]),
    ("recipient_name", &["фио получателя", "получатель"]),
    ("recipient_phone", &["телефон получателя"]),
    ("recipient_bank", &["банк получателя"]),
    ("recipient_card", &["карта получателя"]),
    ("operation_id", &["номер операции"]),
    ("sbp_code", &["код сбп"]),
    ("receipt_number", &["номер квитанции"]),
];

fn normalize(line: &str) -> String {
    line.trim().trim_end_matches(':').trim().to_lowercase()
}

fn label_for(line: &str) -> Option<&'static str> {
    let normalized = normalize(line);
    LABELS
        .iter()
        .find(|(_, variants)| variants.iter().any(|v| normalized == *v))
        .map(|(field, _)| *field)
}

#[derive(Debug, PartialEq, Eq)]
enum Variant {
    Columnar,
    Sequential,
}

fn detect_variant(lines: &[&str]) -> Variant {
    let n = LABELS.len();
    if lines.len() >= n
        && lines[..n]
            .iter()
            .enumerate()
            .all(|(i, line)| label_for(line) == Some(LABELS[i].0))
    {
        Variant::Columnar
    } else {
        Variant::Sequential
    }
}

fn parse_columnar(lines: &[&str]) -> std::collections::HashMap<&'static str, String> {
    let n = LABELS.len();
    let mut out = std::collections::HashMap::new();
    for (i, label) in LABELS.iter().map(|(f, _)| *f).enumerate() {
        if let Some(value) = lines.get(n + i) {
            out.insert(label, value.trim().to_string());
        }
    }
    out
}

fn parse_sequential(lines: &[&str]) -> std::collections::HashMap<&'static str, String> {
    let mut out = std::collections::HashMap::new();
    let mut i = 0;
    while i < lines.len() {
        let (label_part, inline_value) = match lines[i].split_once(':') {
            Some((label, value)) => (label, value.trim()),
            None => (lines[i], ""),
        };
        if let Some(field) = label_for(label_part) {
            if !inline_value.is_empty() {
                out.insert(field, inline_value.to_string());
            } else if let Some(next) = lines.get(i + 1) {
                out.insert(field, next.trim().to_string());
                i += 1;
            }
        }
        i += 1;
    }
    out
}

fn parse_money(raw: &str) -> Option<Money> {
    let digits: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    digits.parse::<i64>().ok().map(Money::from_minor_units)
}

fn parse_datetime(raw: &str) -> Option<OffsetDateTime> {
    // "dd.mm.yyyy HH:MM:SS"
    let parts: Vec<&str> = raw.split_whitespace().collect();
    let (date, time_part) = (parts.first()?, parts.get(1).copied().unwrap_or("00:00:00"));
    let date_parts: Vec<&str> = date.split('.').collect();
    if date_parts.len() != 3 {
        return None;
    }
    let day: u8 = date_parts[0].parse().ok()?;
    let month: u8 = date_parts[1].parse().ok()?;
    let year: i32 = date_parts[2].parse().ok()?;
    let time_parts: Vec<&str> = time_part.split(':').collect();
    let hour: u8 = time_parts.first()?.parse().ok()?;
    let minute: u8 = time_parts.get(1).unwrap_or(&"0").parse().ok()?;
    let second: u8 = time_parts.get(2).unwrap_or(&"0").parse().ok()?;
    let month = time::Month::try_from(month).ok()?;
    let date = time::Date::from_calendar_date(year, month, day).ok()?;
    let time = time::Time::from_hms(hour, minute, second).ok()?;
    Some(time::PrimitiveDateTime::new(date, time).assume_utc())
}

/// Parses raw PDF-extracted text into [`ReceiptFields`]. Fails with the
/// list of fields it could not fill, per spec.md: "Parsing fails with a
/// diagnostic listing each missing required field".
pub fn parse_receipt_text(text: &str) -> Result<ReceiptFields> {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let values = match detect_variant(&lines) {
        Variant::Columnar => parse_columnar(&lines),
        Variant::Sequential => parse_sequential(&lines),
    };

    let get = |field: &str| values.get(field).cloned();

    let commission = match get("commission").as_deref() {
        Some(raw) if raw.to_lowercase().contains("без комиссии") => Some(Money::ZERO),
        Some(raw) => parse_money(raw),
        None => None,
    };

    let mut missing = Vec::new();
    macro_rules! require {
        ($field:expr, $missing_name:literal) => {
            match $field {
                Some(v) => v,
                None => {
                    missing.push($missing_name);
                    Default::default()
                }
            }
        };
    }

    let datetime = match get("datetime").as_deref().and_then(parse_datetime) {
        Some(v) => v,
        None => {
            missing.push("datetime");
            OffsetDateTime::UNIX_EPOCH
        }
    };
    let total = match get("total").as_deref().and_then(parse_money) {
        Some(v) => v,
        None => {
            missing.push("total");
            Money::ZERO
        }
    };
    let amount = match get("amount").as_deref().and_then(parse_money) {
        Some(v) => v,
        None => {
            missing.push("amount");
            Money::ZERO
        }
    };
    let commission = commission.unwrap_or_else(|| {
        missing.push("commission");
        Money::ZERO
    });
    let status = require!(get("status"), "status");
    let transfer_type = require!(get("transfer_type"), "transfer_type");
    let sender_name = require!(get("sender_name"), "sender_name");
    let sender_account = require!(get("sender_account"), "sender_account");
    let recipient_name = require!(get("recipient_name"), "recipient_name");
    let recipient_phone = require!(get("recipient_phone"), "recipient_phone");
    let recipient_bank = require!(get("recipient_bank"), "recipient_bank");
    let recipient_card = require!(get("recipient_card"), "recipient_card");
    let operation_id = require!(get("operation_id"), "operation_id");
    let sbp_code = require!(get("sbp_code"), "sbp_code");
    let receipt_number = require!(get("receipt_number"), "receipt_number");

    if !missing.is_empty() {
        return Err(ReceiptParseError::MissingFields(missing));
    }

    if recipient_phone.is_empty() || !recipient_phone.starts_with("+7") {
        return Err(ReceiptParseError::MissingFields(vec!["recipient_phone"]));
    }

    Ok(ReceiptFields {
        datetime,
        total,
        amount,
        commission,
        status,
        transfer_type,
        sender_name,
        sender_account,
        recipient_name,
        recipient_phone,
        recipient_bank,
        recipient_card,
        operation_id,
        sbp_code,
        receipt_number,
    })
}

/// PDF text extraction: a CPU-bound out-of-scope external collaborator
/// (spec.md §1); bounded at the call site by a semaphore per §5.
#[async_trait]
pub trait PdfTextExtractor: Send + Sync {
    async fn extract(&self, bytes: Vec<u8>) -> anyhow::Result<String>;
}

pub struct RealPdfTextExtractor;

#[async_trait]
impl PdfTextExtractor for RealPdfTextExtractor {
    async fn extract(&self, bytes: Vec<u8>) -> anyhow::Result<String> {
        tokio::task::spawn_blocking(move || {
            pdf_extract::extract_text_from_mem(&bytes).map_err(anyhow::Error::from)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEQUENTIAL_SAMPLE: &str = "\
Дата и время: 12.03.2024 14:33:01
Сумма: 15000.00 ₽
Сумма перевода: 15000.00 ₽
Комиссия: без комиссии
Статус: Успешно
Тип операции: Перевод по номеру телефона
ФИО отправителя: Иван И.
Счет списания: *1234
ФИО получателя: Петр П.
Телефон получателя: +79991234567
Банк получателя: Сбербанк
Карта получателя: *5678
Номер операции: OP-001
Код СБП: SBP-1
Номер квитанции: R-100";

    #[test]
    fn parses_sequential_variant() {
        let fields = parse_receipt_text(SEQUENTIAL_SAMPLE).unwrap();
        assert_eq!(fields.amount, Money::from_minor_units(1500000));
        assert_eq!(fields.commission, Money::ZERO);
        assert_eq!(fields.recipient_phone, "+79991234567");
        assert_eq!(fields.recipient_bank, "Сбербанк");
    }

    #[test]
    fn parses_columnar_variant() {
        let labels = LABELS.iter().map(|(_, v)| v[0]).collect::<Vec<_>>().join("\n");
        let values = "\
12.03.2024 14:33:01
15000.00
15000.00
без комиссии
Успешно
Перевод по номеру телефона
Иван И.
*1234
Петр П.
+79991234567
Сбербанк
*5678
OP-001
SBP-1
R-100";
        let text = format!("{labels}\n{values}");
        assert_eq!(detect_variant(&text.lines().collect::<Vec<_>>()), Variant::Columnar);
        let fields = parse_receipt_text(&text).unwrap();
        assert_eq!(fields.amount, Money::from_minor_units(1500000));
        assert_eq!(fields.recipient_name, "Петр П.");
    }

    #[test]
    fn reports_missing_fields() {
        let text = "Дата и время: 12.03.2024 14:33:01\nСумма: 100";
        let err = parse_receipt_text(text).unwrap_err();
        match err {
            ReceiptParseError::MissingFields(fields) => {
                assert!(fields.contains(&"recipient_phone"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
