//! 算力格式化与解析
//!
//! worker 输出的算力行和日志中的算力显示都经过这里。

const UNITS: [(f64, &str); 6] = [
    (1e15, "PH/s"),
    (1e12, "TH/s"),
    (1e9, "GH/s"),
    (1e6, "MH/s"),
    (1e3, "KH/s"),
    (1.0, "H/s"),
];

/// 格式化算力，自动选择单位
///
/// # 示例
/// ```
/// use switchminer_rs::utils::hashrate_formatter::format_hashrate;
///
/// assert_eq!(format_hashrate(1234.0), "1.234 KH/s");
/// assert_eq!(format_hashrate(31_500_000.0), "31.50 MH/s");
/// ```
pub fn format_hashrate(hashrate: f64) -> String {
    if !hashrate.is_finite() {
        return "∞ H/s".to_string();
    }
    if hashrate <= 0.0 {
        return "0.00 H/s".to_string();
    }

    let (scale, unit) = UNITS
        .iter()
        .copied()
        .find(|(scale, _)| hashrate >= *scale)
        .unwrap_or((1.0, "H/s"));
    let value = hashrate / scale;

    if value >= 100.0 {
        format!("{:.1} {}", value, unit)
    } else if value >= 10.0 {
        format!("{:.2} {}", value, unit)
    } else if value >= 1.0 {
        format!("{:.3} {}", value, unit)
    } else {
        format!("{:.6} {}", value, unit)
    }
}

/// 解析带单位的算力字符串，返回 H/s
///
/// # 示例
/// ```
/// use switchminer_rs::utils::hashrate_formatter::parse_hashrate;
///
/// assert_eq!(parse_hashrate("1.5 GH/s"), Some(1_500_000_000.0));
/// assert_eq!(parse_hashrate("2.3M"), Some(2_300_000.0));
/// ```
pub fn parse_hashrate(hashrate_str: &str) -> Option<f64> {
    let s = hashrate_str.trim().to_uppercase();
    let s = s.strip_suffix("/S").unwrap_or(&s);

    let split_pos = s.find(|c: char| c.is_alphabetic()).unwrap_or(s.len());
    let (number_part, unit_part) = s.split_at(split_pos);
    let number = number_part.trim().parse::<f64>().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }

    let multiplier = match unit_part.trim() {
        "" | "H" => 1.0,
        "KH" | "K" => 1e3,
        "MH" | "M" => 1e6,
        "GH" | "G" => 1e9,
        "TH" | "T" => 1e12,
        "PH" | "P" => 1e15,
        _ => return None,
    };

    Some(number * multiplier)
}

/// 从 worker 的一行输出中提取算力
///
/// 支持 `... 31.5 MH/s ...`、`speed 31.5MH/s` 和 `hashrate=31500000` 三种写法。
pub fn extract_hashrate(line: &str) -> Option<f64> {
    let tokens: Vec<&str> = line
        .split(|c: char| c.is_whitespace() || c == ',' || c == '=' || c == ';')
        .map(|token| token.trim_matches(|c: char| c == '(' || c == ')' || c == '[' || c == ']'))
        .filter(|token| !token.is_empty())
        .collect();

    for (index, token) in tokens.iter().enumerate() {
        if !token.to_uppercase().ends_with("H/S") {
            continue;
        }
        if let Some(hashrate) = parse_hashrate(token) {
            return Some(hashrate);
        }
        if index > 0 {
            if let Some(hashrate) = parse_hashrate(&format!("{}{}", tokens[index - 1], token)) {
                return Some(hashrate);
            }
        }
    }

    tokens.windows(2).find_map(|pair| {
        let key = pair[0].trim_end_matches(':');
        if key.eq_ignore_ascii_case("hashrate") {
            parse_hashrate(pair[1])
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hashrate() {
        assert_eq!(format_hashrate(0.0), "0.00 H/s");
        assert_eq!(format_hashrate(123.0), "123.0 H/s");
        assert_eq!(format_hashrate(1234.0), "1.234 KH/s");
        assert_eq!(format_hashrate(1_234_567.0), "1.235 MH/s");
        assert_eq!(format_hashrate(1_234_567_890_123.0), "1.235 TH/s");
        assert_eq!(format_hashrate(0.5), "0.500000 H/s");
    }

    #[test]
    fn test_parse_hashrate() {
        assert_eq!(parse_hashrate("1.5 GH/s"), Some(1_500_000_000.0));
        assert_eq!(parse_hashrate("100 MH/s"), Some(100_000_000.0));
        assert_eq!(parse_hashrate("42"), Some(42.0));
        assert_eq!(parse_hashrate("12 kH/s"), Some(12_000.0));
        assert_eq!(parse_hashrate("MH/s"), None);
        assert_eq!(parse_hashrate("invalid"), None);
        assert_eq!(parse_hashrate("-5 MH/s"), None);
    }

    #[test]
    fn test_extract_hashrate() {
        assert_eq!(extract_hashrate("GPU0: 31.50 MH/s, shares 12/0"), Some(31_500_000.0));
        assert_eq!(extract_hashrate("[2024-01-01] speed 750H/s"), Some(750.0));
        assert_eq!(extract_hashrate("GPU0: -5 MH/s"), None);
        assert_eq!(extract_hashrate("hashrate=1200"), Some(1200.0));
        assert_eq!(extract_hashrate("Hashrate: 2.5 kH/s"), Some(2500.0));
        assert_eq!(extract_hashrate("connected to pool"), None);
    }
}
