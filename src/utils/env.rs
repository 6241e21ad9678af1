//! Parsing of size and flag values coming from environment variables and the
//! command line. Sizes accept an optional `k`/`m`/`g` suffix, optionally
//! followed by `b`.

pub fn parse_float_and_factor(value: &str) -> Option<(f64, usize)> {
    let mut value = value.trim();
    if value.is_empty() {
        return None;
    }

    if value.len() > 1 && (value.ends_with('b') || value.ends_with('B')) {
        value = &value[..value.len() - 1];
    }

    let (digits, factor) = match value.as_bytes()[value.len() - 1] {
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'k' | b'K' => (&value[..value.len() - 1], 1024),
        _ => (value, 1),
    };

    digits.parse::<f64>().ok().map(|x| (x, factor))
}

pub fn read_uint_from_str(value: &str) -> Option<usize> {
    let (value, factor) = parse_float_and_factor(value)?;
    if value < 0.0 {
        return None;
    }
    Some((value * factor as f64) as usize)
}

pub fn read_bool_from_str(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn read_uint_from_env(var: &str) -> Option<usize> {
    std::env::var(var).ok().and_then(|v| read_uint_from_str(&v))
}

pub fn read_float_from_env(var: &str) -> Option<f64> {
    std::env::var(var)
        .ok()
        .and_then(|v| parse_float_and_factor(&v))
        .map(|x| x.0)
}

pub fn read_bool_from_env(var: &str) -> Option<bool> {
    std::env::var(var).ok().and_then(|v| read_bool_from_str(&v))
}
