use std::{env, panic, process, thread, time};

use hwal::miniscript::bitcoin::psbt::Psbt;
use hwal::{Bip32Path, Config, DeviceKind, SignRequest};

/// A panic in any thread should stop the process and log the panic with a backtrace, rather than
/// leave a half-open device session hanging.
fn setup_panic_hook() {
    panic::set_hook(Box::new(move |panic_info| {
        let file = panic_info.location().map(|l| l.file()).unwrap_or("'unknown'");
        let line = panic_info
            .location()
            .map(|l| l.line().to_string())
            .unwrap_or_else(|| "'unknown'".to_string());
        let bt = backtrace::Backtrace::new();
        let info = panic_info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic_info.payload().downcast_ref::<String>().cloned());
        log::error!("panic occurred at line {} of file {}: {:?}\n{:?}", line, file, info, bt);
        process::exit(1);
    }));
}

fn print_help_exit(code: i32) -> ! {
    eprintln!("hwal-cli {}", hwal::VERSION);
    eprintln!("Usage: hwal-cli [--conf <config file path>] <command> [<args>...]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  list                           list registered and connected adapters");
    eprintln!("  connect [ledger|trezor|bitbox02|jade]  connect to a device, optionally by type");
    eprintln!("  get-xpub <path>                fetch an xpub at a derivation path, e.g. m/84'/0'/0'");
    eprintln!("  sign-psbt <base64 psbt>        sign a PSBT on the connected device");
    eprintln!("  disconnect                     close the active device session");
    process::exit(code);
}

fn print_version() -> ! {
    eprintln!("{}", hwal::VERSION);
    process::exit(0);
}

struct Args {
    conf_file: Option<std::path::PathBuf>,
    command: String,
    rest: Vec<String>,
}

fn parse_args(mut args: Vec<String>) -> Args {
    if args.len() < 2 {
        print_help_exit(1);
    }
    args.remove(0);

    let mut conf_file = None;
    let mut iter = args.into_iter().peekable();
    loop {
        match iter.peek().map(String::as_str) {
            Some("--help") | Some("-h") => print_help_exit(0),
            Some("--version") | Some("-v") => print_version(),
            Some("--conf") => {
                iter.next();
                let path = iter.next().unwrap_or_else(|| print_help_exit(1));
                conf_file = Some(std::path::PathBuf::from(path));
            }
            Some(_) => break,
            None => print_help_exit(1),
        }
    }

    let command = iter.next().unwrap_or_else(|| print_help_exit(1));
    Args {
        conf_file,
        command,
        rest: iter.collect(),
    }
}

fn setup_logger(log_level: log::LevelFilter) -> Result<(), fern::InitError> {
    let dispatcher = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}][thread {}] {}",
                time::SystemTime::now()
                    .duration_since(time::UNIX_EPOCH)
                    .unwrap_or(time::Duration::from_secs(0))
                    .as_secs(),
                record.target(),
                record.level(),
                thread::current().name().unwrap_or("unnamed"),
                message
            ))
        })
        .level(log_level);
    dispatcher.chain(std::io::stderr()).apply()?;
    Ok(())
}

fn device_kind_from_str(s: &str) -> Option<DeviceKind> {
    match s {
        "ledger" => Some(DeviceKind::Ledger),
        "trezor" => Some(DeviceKind::Trezor),
        "bitbox02" => Some(DeviceKind::BitBox02),
        "jade" => Some(DeviceKind::Jade),
        _ => None,
    }
}

#[tokio::main]
async fn main() {
    setup_panic_hook();
    let args = parse_args(env::args().collect());

    let config = Config::from_file(args.conf_file).unwrap_or_else(|_| Config::default());
    setup_logger(config.log_level).unwrap_or_else(|e| {
        eprintln!("Error setting up logger: {}", e);
        process::exit(1);
    });

    let registry = hwal::default_registry(&config).await;

    let result = match args.command.as_str() {
        "list" => {
            let devices = registry.enumerate_devices().await;
            serde_json::to_string_pretty(&devices.iter().map(|d| d.kind.as_str()).collect::<Vec<_>>())
        }
        "connect" => {
            let kind = args.rest.first().and_then(|s| device_kind_from_str(s));
            match registry.connect(kind).await {
                Ok(descriptor) => serde_json::to_string_pretty(&serde_json::json!({
                    "kind": descriptor.kind.as_str(),
                    "fingerprint": descriptor.fingerprint.to_string(),
                    "version": descriptor.version,
                })),
                Err(e) => {
                    log::error!("connect failed: {}", e);
                    process::exit(1);
                }
            }
        }
        "disconnect" => match registry.disconnect().await {
            Ok(()) => Ok("{}".to_string()),
            Err(e) => {
                log::error!("disconnect failed: {}", e);
                process::exit(1);
            }
        },
        "get-xpub" => {
            let path_str = args.rest.first().unwrap_or_else(|| print_help_exit(1));
            let path: Bip32Path = path_str.parse().unwrap_or_else(|e| {
                eprintln!("Invalid derivation path: {}", e);
                process::exit(1);
            });
            match registry.get_xpub(&path).await {
                Ok(result) => serde_json::to_string_pretty(&serde_json::json!({
                    "xpub": result.xpub.to_string(),
                    "master_fingerprint": result.master_fingerprint.to_string(),
                })),
                Err(e) => {
                    log::error!("get-xpub failed: {}", e);
                    process::exit(1);
                }
            }
        }
        "sign-psbt" => {
            let psbt_b64 = args.rest.first().unwrap_or_else(|| print_help_exit(1));
            let psbt = decode_psbt(psbt_b64).unwrap_or_else(|e| {
                eprintln!("Invalid PSBT: {}", e);
                process::exit(1);
            });
            match registry.sign_psbt(SignRequest::new(psbt)).await {
                Ok(response) => {
                    let mut out_bytes = Vec::new();
                    response
                        .psbt
                        .serialize_to_writer(&mut out_bytes)
                        .expect("serializing a signed PSBT back to bytes cannot fail");
                    serde_json::to_string_pretty(&serde_json::json!({
                        "psbt": base64_encode(&out_bytes),
                        "signature_count": response.signature_count,
                        "raw_tx": response.raw_tx.as_ref().map(hex::encode),
                    }))
                }
                Err(e) => {
                    log::error!("sign-psbt failed: {}", e);
                    process::exit(1);
                }
            }
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_help_exit(1);
        }
    };

    match result {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error formatting response: {}", e);
            process::exit(1);
        }
    }
}

fn decode_psbt(b64: &str) -> Result<Psbt, String> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| e.to_string())?;
    Psbt::deserialize(&bytes).map_err(|e| e.to_string())
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
