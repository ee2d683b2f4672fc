use std::process;
use std::time::Duration;

use clap::{App, Arg};
use failure::Fail;

use usb_proxy::ProxyConfig;

fn parse_hex_or_decimal(s: &str) -> Result<u16, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        s.parse::<u16>().map_err(|e| e.to_string())
    }
}

fn main() {
    let matches = App::new("usb-proxy")
        .about("Transparent USB man-in-the-middle proxy")
        .arg(Arg::with_name("vendor-id").long("vendor-id").takes_value(true).required(true))
        .arg(Arg::with_name("product-id").long("product-id").takes_value(true).required(true))
        .arg(Arg::with_name("driver-name").long("driver-name").takes_value(true).required(true))
        .arg(Arg::with_name("device-name").long("device-name").takes_value(true).required(true))
        .arg(Arg::with_name("rules").long("rules").takes_value(true))
        .arg(Arg::with_name("ep0-floor").long("ep0-floor").takes_value(true).default_value("64"))
        .arg(Arg::with_name("queue-capacity").long("queue-capacity").takes_value(true))
        .arg(Arg::with_name("grace-window-ms").long("grace-window-ms").takes_value(true))
        .arg(Arg::with_name("open-deadline-ms").long("open-deadline-ms").takes_value(true))
        .arg(Arg::with_name("v").short("v").multiple(true).help("Increase logging verbosity (-v, -vv, -vvv)"))
        .get_matches();

    let verbosity = matches.occurrences_of("v");
    init_logging(verbosity);

    match build_config(&matches) {
        Ok(config) => {
            if let Err(e) = usb_proxy::run(config) {
                eprint_error_chain(&e);
                process::exit(1);
            }
        }
        Err(message) => {
            eprintln!("usb-proxy: {}", message);
            process::exit(2);
        }
    }
}

fn build_config(matches: &clap::ArgMatches) -> Result<ProxyConfig, String> {
    let vendor_id = parse_hex_or_decimal(matches.value_of("vendor-id").unwrap())?;
    let product_id = parse_hex_or_decimal(matches.value_of("product-id").unwrap())?;
    let driver_name = matches.value_of("driver-name").unwrap().to_string();
    let device_name = matches.value_of("device-name").unwrap().to_string();

    let mut config = ProxyConfig::new(vendor_id, product_id, driver_name, device_name);
    config.rule_file = matches.value_of("rules").map(String::from);

    if let Some(v) = matches.value_of("ep0-floor") {
        config.ep0_floor = v.parse().map_err(|_| format!("invalid --ep0-floor value: {}", v))?;
    }
    if let Some(v) = matches.value_of("queue-capacity") {
        config.queue_capacity = v.parse().map_err(|_| format!("invalid --queue-capacity value: {}", v))?;
    }
    if let Some(v) = matches.value_of("grace-window-ms") {
        let ms: u64 = v.parse().map_err(|_| format!("invalid --grace-window-ms value: {}", v))?;
        config.grace_window = Duration::from_millis(ms);
    }
    if let Some(v) = matches.value_of("open-deadline-ms") {
        let ms: u64 = v.parse().map_err(|_| format!("invalid --open-deadline-ms value: {}", v))?;
        config.open_deadline = Duration::from_millis(ms);
    }

    Ok(config)
}

fn init_logging(verbosity: u64) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn eprint_error_chain(error: &usb_proxy::ProxyError) {
    eprintln!("usb-proxy: {}", error);
    let mut cause = error.cause();
    while let Some(c) = cause {
        eprintln!("  caused by: {}", c);
        cause = c.cause();
    }
}
