use clap::Parser;
use std::path::PathBuf;

/// Largest element count accepted on the command line.
pub const MAX_ELEMENTS: u32 = 1 << 26;

/// CLI surface for the add-and-reduce compute demo.
#[derive(Debug, Parser)]
#[command(author, version, about = "Run an element-wise add and a per-group reduction on the GPU", long_about = None)]
pub struct Args {
    /// Index of the adapter to run on. Prompts on stdin when omitted
    #[arg(short, long, allow_negative_numbers = true)]
    pub adapter: Option<i64>,

    /// Number of integers to process
    #[arg(short, long, default_value_t = 4096, value_parser = clap::value_parser!(u32).range(1..=MAX_ELEMENTS as i64))]
    pub elements: u32,

    /// Value the kernel adds to every source element
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    pub add_value: i32,

    /// Precompiled SPIR-V compute shader to use instead of the embedded kernel
    #[arg(short, long)]
    pub shader: Option<PathBuf>,

    /// Enable the Khronos validation layer (always requested in debug builds)
    #[arg(long)]
    pub validation: bool,

    /// Reduce with shared memory only, even when subgroup arithmetic is available
    #[arg(long)]
    pub no_subgroups: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub adapter: Option<i64>,
    pub elements: u32,
    pub add_value: i32,
    pub shader: Option<PathBuf>,
    pub validation: bool,
    pub use_subgroups: bool,
}

impl From<Args> for RunConfig {
    fn from(args: Args) -> Self {
        RunConfig {
            adapter: args.adapter,
            elements: args.elements,
            add_value: args.add_value,
            shader: args.shader,
            validation: args.validation || cfg!(debug_assertions),
            use_subgroups: !args.no_subgroups,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            adapter: None,
            elements: 4096,
            add_value: 1,
            shader: None,
            validation: cfg!(debug_assertions),
            use_subgroups: true,
        }
    }
}

/// Parses an adapter choice the way C `atoi` would: optional leading
/// whitespace and sign, then digits up to the first non-digit. Anything
/// unparsable yields 0.
pub fn parse_adapter_choice(input: &str) -> i64 {
    let trimmed = input.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let value = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, d| acc.saturating_mul(10).saturating_add((d - b'0') as i64));
    if negative { -value } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_classic_run() {
        let config = RunConfig::from(Args::try_parse_from(["add-reduce"]).unwrap());
        assert_eq!(config.elements, 4096);
        assert_eq!(config.add_value, 1);
        assert_eq!(config.adapter, None);
        assert!(config.use_subgroups);
        assert_eq!(config.validation, cfg!(debug_assertions));
    }

    #[test]
    fn parses_every_option() {
        let args = Args::try_parse_from([
            "add-reduce",
            "--adapter",
            "2",
            "--elements",
            "1500",
            "--add-value",
            "-7",
            "--shader",
            "shaders/add_reduce.spv",
            "--validation",
            "--no-subgroups",
        ])
        .unwrap();
        let config = RunConfig::from(args);
        assert_eq!(config.adapter, Some(2));
        assert_eq!(config.elements, 1500);
        assert_eq!(config.add_value, -7);
        assert_eq!(config.shader, Some(PathBuf::from("shaders/add_reduce.spv")));
        assert!(config.validation);
        assert!(!config.use_subgroups);
    }

    #[test]
    fn rejects_out_of_range_element_counts() {
        assert!(Args::try_parse_from(["add-reduce", "--elements", "0"]).is_err());
        let too_many = (MAX_ELEMENTS as u64 + 1).to_string();
        assert!(Args::try_parse_from(["add-reduce", "--elements", too_many.as_str()]).is_err());
    }

    #[test]
    fn negative_adapter_reaches_the_fallback() {
        let args = Args::try_parse_from(["add-reduce", "--adapter", "-1"]).unwrap();
        assert_eq!(args.adapter, Some(-1));
        assert_eq!(RunConfig::from(args).adapter, Some(-1));
    }

    #[test]
    fn adapter_choice_behaves_like_atoi() {
        assert_eq!(parse_adapter_choice("1\n"), 1);
        assert_eq!(parse_adapter_choice("  12abc"), 12);
        assert_eq!(parse_adapter_choice("-3"), -3);
        assert_eq!(parse_adapter_choice("+4"), 4);
        assert_eq!(parse_adapter_choice("gpu"), 0);
        assert_eq!(parse_adapter_choice(""), 0);
    }
}
