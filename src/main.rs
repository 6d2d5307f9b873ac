mod cli;

use std::io;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::{generate, shells::Bash};
use log::{error, warn};

use laserfalcon::device::{Device, Measurement};

use cli::{Cli, Commands, StructOpt};

enum OutputFormat {
    Plain,
    Json,
}

fn measurement_to_json(measurement: &Measurement) -> json::JsonValue {
    let mut obj = json::JsonValue::new_object();
    obj["error"] = measurement.error.into();
    obj["main_value"] = measurement.main_value.into();
    obj["samples"] = measurement
        .samples
        .iter()
        .map(|sample| {
            let mut entry = json::JsonValue::new_object();
            entry["value"] = sample.value.into();
            entry["freq1"] = sample.freq1.into();
            entry["freq2"] = sample.freq2.into();
            entry["time"] = sample.time.into();
            entry
        })
        .collect::<Vec<_>>()
        .into();
    obj
}

fn measurement_to_plain(measurement: &Measurement) -> String {
    let mut lines = vec![
        format!("error {}", measurement.error),
        format!("main {}", measurement.main_value),
    ];
    for sample in &measurement.samples {
        lines.push(format!(
            "{} {} {} {}",
            sample.value, sample.freq1, sample.freq2, sample.time
        ));
    }
    lines.join("\n")
}

fn cmd_version(device: &mut Device, _fmt: OutputFormat) -> Result<String> {
    device.get_version()
}

fn cmd_settings(device: &mut Device, fmt: OutputFormat) -> Result<String> {
    let settings = device.get_settings()?;

    Ok(match fmt {
        OutputFormat::Plain => {
            let mut lines: Vec<String> = settings
                .iter()
                .map(|(key, value)| format!("{} {}", key, value))
                .collect();
            lines.sort();
            lines.join("\n")
        }
        OutputFormat::Json => {
            let mut obj = json::JsonValue::new_object();
            for (key, value) in &settings {
                obj[key.as_str()] = value.as_str().into();
            }
            json::stringify(obj)
        }
    })
}

fn cmd_measure(
    device: &mut Device,
    count: u32,
    interval: Duration,
    fmt: OutputFormat,
) -> Result<String> {
    let mut out = Vec::new();

    for n in 0..count {
        if n > 0 {
            thread::sleep(interval);
        }

        let measurement = device.get_measurement()?;
        if !measurement.is_ok() {
            warn!("instrument reported error code {}", measurement.error);
        }

        out.push(match fmt {
            OutputFormat::Plain => measurement_to_plain(&measurement),
            OutputFormat::Json => json::stringify(measurement_to_json(&measurement)),
        });
    }

    Ok(out.join("\n"))
}

fn cmd_raw(device: &mut Device, command: &str) -> Result<String> {
    let payload = device.send_command(command.as_bytes())?;
    Ok(String::from_utf8_lossy(&payload).to_string())
}

fn do_main() -> Result<String> {
    if std::env::var("GENERATE_COMPLETION").is_ok() {
        generate(
            Bash,
            &mut cli::Cli::command(),
            "laserfalcon-tool",
            &mut io::stdout(),
        );

        return Ok(String::default());
    }

    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.debug {
        "debug"
    } else {
        "info"
    }))
    .format_timestamp(None)
    .format_target(false)
    .init();

    let fmt = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Plain
    };

    let mut device = Device::open(
        &cli.port,
        cli.baudrate,
        Duration::from_secs(cli.timeout),
        cli.force,
    )?;

    match cli.command {
        Commands::Version => cmd_version(&mut device, fmt),
        Commands::Settings => cmd_settings(&mut device, fmt),
        Commands::Measure { count, interval } => {
            cmd_measure(&mut device, count, Duration::from_millis(interval), fmt)
        }
        Commands::Raw { command } => cmd_raw(&mut device, &command),
    }
}

fn main() {
    match do_main() {
        Ok(s) => println!("{}", s),
        Err(e) => error!("{:#}", e),
    }
}
