use num_traits::ToPrimitive;

/// Formats a dollar amount with thousands separators, e.g. `$10,000,000`.
pub(crate) fn format_dollars(amount: f64) -> String {
    let Some(whole) = amount.round().to_i64() else {
        return format!("${amount:.0}");
    };
    let digits = whole.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, digit) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    if whole < 0 {
        format!("-${grouped}")
    } else {
        format!("${grouped}")
    }
}

pub(crate) fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
