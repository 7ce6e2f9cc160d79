use ferris_contract_stream::{ContractDuration, TradeType};

const DEFAULT_INSTRUMENT: &str = "R_100";
const DEFAULT_DURATION: &str = "5t";
const DEFAULT_CURRENCY: &str = "USD";
const DEFAULT_PAYOUT: f64 = 10.0;

const USAGE: &str = r#"Usage:
  cargo run --bin price_stream -- <mode> [options]

Modes:
  watch        Subscribe to a live contract price and print updates
  details      Fetch the details of one contract
  sell         Sell one open contract

Common options:
  --token <token>          Bearer token (default: AUTH_TOKEN)
  --stream-url <url>       Price stream websocket URL (default: STREAM_URL)
  --rest-url <url>         REST base URL (default: REST_BASE_URL)

Mode-specific options:
  watch:
    --instrument <symbol>  Instrument (default: R_100)
    --trade-type <type>    rise_fall, higher_lower, touch_no_touch, ends_in_out,
                           multiplier or accumulator (default: rise_fall)
    --duration <duration>  Contract duration such as `5t` or `10 minutes` (default: 5t)
    --currency <code>      Stake currency (default: USD)
    --payout <amount>      Payout amount (default: 10)
    --strike <price>       Barrier/strike price (default: none)
    --duration-secs <secs> Stop after this duration
    --iterations <count>   Stop after this many price updates

  details, sell:
    --contract-id <id>     Contract identifier (required)

Examples:
  cargo run --bin price_stream -- watch --instrument R_50 --duration "3 ticks" --iterations 5
  cargo run --bin price_stream -- details --contract-id 12345
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Watch,
    Details,
    Sell,
}

impl Mode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Watch => "watch",
            Self::Details => "details",
            Self::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) mode: Mode,
    pub(crate) token: Option<String>,
    pub(crate) stream_url: Option<String>,
    pub(crate) rest_url: Option<String>,
    pub(crate) instrument: String,
    pub(crate) trade_type: TradeType,
    pub(crate) duration: ContractDuration,
    pub(crate) currency: String,
    pub(crate) payout: f64,
    pub(crate) strike: Option<f64>,
    pub(crate) duration_secs: Option<u64>,
    pub(crate) iterations: Option<u64>,
    pub(crate) contract_id: Option<String>,
}

#[derive(Debug)]
pub(crate) enum ParseResult {
    Help,
    Run(Config),
}

pub(crate) fn print_usage() {
    println!("{USAGE}");
}

pub(crate) fn parse_args(args: &[String]) -> Result<ParseResult, String> {
    if args.is_empty() || args.iter().any(|arg| arg == "--help" || arg == "-h") {
        return Ok(ParseResult::Help);
    }

    let mode = parse_mode(&args[0])?;

    let mut config = Config {
        mode,
        token: None,
        stream_url: None,
        rest_url: None,
        instrument: DEFAULT_INSTRUMENT.to_string(),
        trade_type: TradeType::RiseFall,
        duration: DEFAULT_DURATION
            .parse()
            .map_err(|err| format!("invalid default duration: {err}"))?,
        currency: DEFAULT_CURRENCY.to_string(),
        payout: DEFAULT_PAYOUT,
        strike: None,
        duration_secs: None,
        iterations: None,
        contract_id: None,
    };

    let mut index = 1usize;
    while index < args.len() {
        let flag = &args[index];
        let value = |i: &mut usize| -> Result<String, String> {
            let next = *i + 1;
            if next >= args.len() {
                return Err(format!("missing value for `{flag}`"));
            }
            *i = next;
            Ok(args[*i].clone())
        };

        match flag.as_str() {
            "--token" => {
                config.token = Some(value(&mut index)?);
            }
            "--stream-url" => {
                config.stream_url = Some(value(&mut index)?);
            }
            "--rest-url" => {
                config.rest_url = Some(value(&mut index)?);
            }
            "--instrument" => {
                config.instrument = value(&mut index)?;
            }
            "--trade-type" => {
                config.trade_type = value(&mut index)?.parse()?;
            }
            "--duration" => {
                config.duration = value(&mut index)?.parse()?;
            }
            "--currency" => {
                config.currency = value(&mut index)?;
            }
            "--payout" => {
                config.payout = parse_non_negative_f64("--payout", &value(&mut index)?)?;
            }
            "--strike" => {
                config.strike = Some(parse_finite_f64("--strike", &value(&mut index)?)?);
            }
            "--duration-secs" => {
                config.duration_secs =
                    Some(parse_u64_gt_zero("--duration-secs", &value(&mut index)?)?);
            }
            "--iterations" => {
                config.iterations = Some(parse_u64_gt_zero("--iterations", &value(&mut index)?)?);
            }
            "--contract-id" => {
                config.contract_id = Some(value(&mut index)?);
            }
            _ => {
                return Err(format!("unknown argument `{flag}`"));
            }
        }

        index += 1;
    }

    if config.instrument.trim().is_empty() {
        return Err("`--instrument` cannot be empty".to_string());
    }
    if config.currency.trim().is_empty() {
        return Err("`--currency` cannot be empty".to_string());
    }
    for (flag, value) in [
        ("--token", config.token.as_deref()),
        ("--stream-url", config.stream_url.as_deref()),
        ("--rest-url", config.rest_url.as_deref()),
    ] {
        if value.is_some_and(|value| value.trim().is_empty()) {
            return Err(format!("`{flag}` cannot be empty"));
        }
    }

    match config.mode {
        Mode::Watch => {
            if config.contract_id.is_some() {
                return Err("`--contract-id` is only valid for `details` and `sell`".to_string());
            }
        }
        Mode::Details | Mode::Sell => {
            let has_id = config
                .contract_id
                .as_deref()
                .is_some_and(|id| !id.trim().is_empty());
            if !has_id {
                return Err(format!("`{}` requires `--contract-id`", config.mode.as_str()));
            }
        }
    }

    Ok(ParseResult::Run(config))
}

fn parse_mode(value: &str) -> Result<Mode, String> {
    match value {
        "watch" => Ok(Mode::Watch),
        "details" => Ok(Mode::Details),
        "sell" => Ok(Mode::Sell),
        _ => Err(format!(
            "invalid mode `{value}` (expected `watch`, `details` or `sell`)"
        )),
    }
}

fn parse_u64_gt_zero(field: &str, value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|_| format!("`{field}` expects a positive integer"))?;
    if parsed == 0 {
        return Err(format!("`{field}` must be greater than 0"));
    }
    Ok(parsed)
}

fn parse_finite_f64(field: &str, value: &str) -> Result<f64, String> {
    let parsed = value
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("`{field}` expects a number"))?;
    if !parsed.is_finite() {
        return Err(format!("`{field}` must be finite"));
    }
    Ok(parsed)
}

fn parse_non_negative_f64(field: &str, value: &str) -> Result<f64, String> {
    let parsed = parse_finite_f64(field, value)?;
    if parsed < 0.0 {
        return Err(format!("`{field}` cannot be negative"));
    }
    Ok(parsed)
}
