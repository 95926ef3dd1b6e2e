use chrono::NaiveDate;
use feed_engine::{Classification, Money, NewTransaction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickAddParsed {
    pub classification: Classification,
    pub amount: Money,
    pub category: Option<String>,
    pub note: Option<String>,
}

impl QuickAddParsed {
    pub fn into_new(self, occurred_on: NaiveDate) -> NewTransaction {
        NewTransaction {
            category: self.category,
            note: self.note,
            ..NewTransaction::new(self.classification, self.amount, occurred_on)
        }
    }
}

/// Parses `+12.50 #tag note` (income) or `-12.50 ...` / `12.50 ...` (expense).
pub fn parse(input: &str) -> Result<QuickAddParsed, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("Enter an amount.".to_string());
    }

    let (classification, rest) = if let Some(stripped) = trimmed.strip_prefix('+') {
        (Classification::Income, stripped.trim_start())
    } else if let Some(stripped) = trimmed.strip_prefix('-') {
        (Classification::Expense, stripped.trim_start())
    } else {
        (Classification::Expense, trimmed)
    };

    let mut parts = rest.splitn(2, ' ');
    let amount_raw = parts.next().unwrap_or("").trim();
    if amount_raw.is_empty() {
        return Err("Missing amount.".to_string());
    }
    let note_raw = parts.next().unwrap_or("").trim();

    let amount = amount_raw
        .parse::<Money>()
        .map_err(|_| "Invalid amount.".to_string())?;
    if !amount.is_positive() {
        return Err("Amount must be > 0.".to_string());
    }

    let (category, note) = parse_tag(note_raw)?;

    Ok(QuickAddParsed {
        classification,
        amount,
        category,
        note,
    })
}

fn parse_tag(note_raw: &str) -> Result<(Option<String>, Option<String>), String> {
    if note_raw.is_empty() {
        return Ok((None, None));
    }

    let mut tag: Option<String> = None;
    let mut kept: Vec<&str> = Vec::new();

    for token in note_raw.split_whitespace() {
        match token.strip_prefix('#') {
            Some(rest) if !rest.is_empty() => {
                if tag.is_some() {
                    return Err("Too many tags: at most 1.".to_string());
                }
                tag = Some(rest.to_lowercase());
            }
            _ => kept.push(token),
        }
    }

    let note = kept.join(" ");
    let note = if note.is_empty() { None } else { Some(note) };
    Ok((tag, note))
}
