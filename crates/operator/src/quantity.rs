//! Canonical comparison of resource quantities (`1000m` == `1`, `1Gi` == `1024Mi`).
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const NANO: i128 = 1_000_000_000;

/// Value of a quantity in billionths of its base unit, `None` if it does not parse.
pub fn nano_units(q: &Quantity) -> Option<i128> {
    let s = q.0.trim();
    let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-')).unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let (negative, number) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && frac.is_empty() { return None; }
    let digits: String = format!("{whole}{frac}");
    if !digits.bytes().all(|b| b.is_ascii_digit()) { return None; }
    let mantissa: i128 = digits.parse().ok()?;
    let (mul, div) = scale(suffix)?;
    let frac_div = 10i128.checked_pow(u32::try_from(frac.len()).ok()?)?;
    let value = mantissa.checked_mul(NANO)?.checked_mul(mul)? / frac_div.checked_mul(div)?;
    Some(if negative { -value } else { value })
}

/// Multiplier and divisor for a suffix.
fn scale(suffix: &str) -> Option<(i128, i128)> {
    let binary = |power: u32| Some((1i128 << power, 1));
    let decimal = |exp: i32| if exp >= 0 { Some((10i128.checked_pow(exp.unsigned_abs())?, 1)) } else { Some((1, 10i128.checked_pow(exp.unsigned_abs())?)) };
    match suffix {
        "" => decimal(0),
        "n" => decimal(-9),
        "u" => decimal(-6),
        "m" => decimal(-3),
        "k" => decimal(3),
        "M" => decimal(6),
        "G" => decimal(9),
        "T" => decimal(12),
        "P" => decimal(15),
        "E" => decimal(18),
        "Ki" => binary(10),
        "Mi" => binary(20),
        "Gi" => binary(30),
        "Ti" => binary(40),
        "Pi" => binary(50),
        "Ei" => binary(60),
        s if s.starts_with(['e', 'E']) => decimal(s[1..].parse().ok()?),
        _ => None,
    }
}

pub fn same_quantity(a: &Quantity, b: &Quantity) -> bool {
    match (nano_units(a), nano_units(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a.0 == b.0,
    }
}

/// Two resource lists are equivalent when they name the same resources with equal quantities.
pub fn same_resource_list(a: Option<&BTreeMap<String, Quantity>>, b: Option<&BTreeMap<String, Quantity>>) -> bool {
    let empty = BTreeMap::new();
    let (a, b) = (a.unwrap_or(&empty), b.unwrap_or(&empty));
    a.len() == b.len() && a.iter().all(|(k, qa)| b.get(k).is_some_and(|qb| same_quantity(qa, qb)))
}
