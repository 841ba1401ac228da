//! 实用工具模块

pub mod hashrate_formatter;

pub use hashrate_formatter::{extract_hashrate, format_hashrate, parse_hashrate};

/// 算力显示宏
///
/// ```
/// use switchminer_rs::hashrate;
///
/// assert_eq!(hashrate!(31_500_000.0), "31.50 MH/s");
/// ```
#[macro_export]
macro_rules! hashrate {
    ($hashrate:expr) => {
        $crate::utils::format_hashrate($hashrate)
    };
}
