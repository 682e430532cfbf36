// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    apple_sign_notarize::{
        app_store_connect::{AppStoreConnectNotary, ConnectTokenEncoder, UnifiedApiKey},
        credentials::{CredentialProvider, EphemeralKeychainProvider, StaticCredentialProvider},
        error::PipelineError,
        notary::PollConfig,
        pipeline::{Pipeline, PipelineConfig},
        scanning::BinaryScanner,
        signing::{CodesignBackend, SigningIdentity},
    },
    clap::{Arg, ArgMatches, Command},
    log::{info, LevelFilter},
    std::{path::PathBuf, time::Duration},
};

fn parse_secs(matches: &ArgMatches, name: &str) -> Result<Option<Duration>, PipelineError> {
    matches
        .value_of(name)
        .map(|value| {
            value
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| PipelineError::CliBadArgument(format!("--{} expects seconds", name)))
        })
        .transpose()
}

/// Resolve the notary service from API key arguments.
fn notary_service(matches: &ArgMatches) -> Result<AppStoreConnectNotary, PipelineError> {
    let encoder = if let Some(path) = matches.value_of("api_key_path") {
        ConnectTokenEncoder::try_from(UnifiedApiKey::from_json_path(path)?)?
    } else if let (Some(key_id), Some(issuer_id)) = (
        matches.value_of("api_key_id"),
        matches.value_of("api_issuer_id"),
    ) {
        ConnectTokenEncoder::from_api_key_id(key_id.to_string(), issuer_id.to_string())?
    } else {
        return Err(PipelineError::CliBadArgument(
            "provide --api-key-path or both --api-key-id and --api-issuer-id".to_string(),
        ));
    };

    AppStoreConnectNotary::new(encoder)
}

fn command_run(matches: &ArgMatches) -> Result<i32, PipelineError> {
    let input = PathBuf::from(
        matches
            .value_of("input")
            .ok_or_else(|| PipelineError::CliBadArgument("--input is required".to_string()))?,
    );

    if matches.is_present("dry_run") {
        let graph = BinaryScanner::new(&input).scan()?;
        println!("{}", serde_json::to_string_pretty(graph.artifacts())?);
        return Ok(0);
    }

    let reference = matches
        .value_of("identity")
        .ok_or_else(|| PipelineError::CliBadArgument("--identity is required".to_string()))?;

    let mut identity = SigningIdentity::new(reference);
    identity.hardened_runtime = !matches.is_present("no_hardened_runtime");
    identity.timestamp = !matches.is_present("no_timestamp");
    if let Some(path) = matches.value_of("entitlements") {
        identity = identity.entitlements(path);
    }

    let mut config = PipelineConfig::new(&input);

    config.concurrency = match matches.value_of("concurrency") {
        Some(value) => value.parse::<usize>().map_err(|_| {
            PipelineError::CliBadArgument("--concurrency expects an integer".to_string())
        })?,
        None => 0,
    };
    if config.concurrency == 0 {
        config.concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
    }

    if let Some(timeout) = parse_secs(matches, "timeout")? {
        config.timeout = timeout;
    }

    let mut poll = PollConfig::default();
    if let Some(base) = parse_secs(matches, "poll-base")? {
        poll.base = base;
    }
    if let Some(max) = parse_secs(matches, "poll-max")? {
        poll.max = max;
    }
    if let Some(multiplier) = matches.value_of("poll-multiplier") {
        poll.multiplier = multiplier.parse::<f64>().map_err(|_| {
            PipelineError::CliBadArgument("--poll-multiplier expects a number".to_string())
        })?;
    }
    config.poll = poll;

    config.staple = !matches.is_present("no_staple");
    config.archive_path = matches.value_of("archive").map(PathBuf::from);

    let provider: Box<dyn CredentialProvider> = match matches.value_of("p12_path") {
        Some(p12_path) => Box::new(EphemeralKeychainProvider::new(
            reference,
            p12_path,
            matches.value_of("p12_password").unwrap_or(""),
        )),
        None => Box::new(StaticCredentialProvider::new(reference)),
    };

    let mut backend = CodesignBackend::new()?;
    if let Some(keychain) = matches.value_of("keychain") {
        backend = backend.with_keychain(keychain);
    }

    let service = notary_service(matches)?;

    let run = Pipeline::new(&backend, &service, provider.as_ref(), identity, config).run();

    if let Some(path) = matches.value_of("report") {
        std::fs::write(path, serde_json::to_string_pretty(&run)?)?;
        info!("wrote run report to {}", path);
    }

    match &run.outcome {
        apple_sign_notarize::pipeline::RunOutcome::Success { degraded } => {
            if *degraded {
                info!("run succeeded; stapling degraded, artifacts validate online");
            } else {
                info!("run succeeded");
            }
        }
        apple_sign_notarize::pipeline::RunOutcome::Failed { stage, reason } => {
            eprintln!("run failed during {:?}: {}", stage, reason);
        }
    }

    Ok(run.exit_code())
}

fn main_impl() -> Result<i32, PipelineError> {
    let app = Command::new("sign-and-notarize")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sign, notarize, and staple macOS software for distribution")
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        )
        .arg(
            Arg::new("input")
                .long("input")
                .short('i')
                .takes_value(true)
                .required(true)
                .help("Directory containing the binaries and bundles to process"),
        )
        .arg(
            Arg::new("identity")
                .long("identity")
                .takes_value(true)
                .help("Signing identity reference (certificate name or SHA-1 fingerprint)"),
        )
        .arg(
            Arg::new("entitlements")
                .long("entitlements")
                .takes_value(true)
                .help("Path to an entitlements plist applied to every signature"),
        )
        .arg(
            Arg::new("no_hardened_runtime")
                .long("no-hardened-runtime")
                .help("Do not enable the hardened runtime when signing"),
        )
        .arg(
            Arg::new("no_timestamp")
                .long("no-timestamp")
                .help("Do not request a secure timestamp when signing"),
        )
        .arg(
            Arg::new("keychain")
                .long("keychain")
                .takes_value(true)
                .help("Keychain holding the signing identity"),
        )
        .arg(
            Arg::new("p12_path")
                .long("p12-file")
                .takes_value(true)
                .help("Import a PKCS#12 certificate into an ephemeral keychain for this run"),
        )
        .arg(
            Arg::new("p12_password")
                .long("p12-password")
                .takes_value(true)
                .requires("p12_path")
                .help("Password for the PKCS#12 file"),
        )
        .arg(
            Arg::new("api_key_path")
                .long("api-key-path")
                .takes_value(true)
                .help("Path to a unified App Store Connect API key JSON file"),
        )
        .arg(
            Arg::new("api_key_id")
                .long("api-key-id")
                .takes_value(true)
                .requires("api_issuer_id")
                .help("App Store Connect API Key ID (looks up AuthKey_<id>.p8)"),
        )
        .arg(
            Arg::new("api_issuer_id")
                .long("api-issuer-id")
                .takes_value(true)
                .help("App Store Connect API Issuer ID"),
        )
        .arg(
            Arg::new("concurrency")
                .long("concurrency")
                .takes_value(true)
                .help("Maximum artifacts signed in parallel (0 = number of CPUs)"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .takes_value(true)
                .default_value("3600")
                .help("Overall notarization budget in seconds"),
        )
        .arg(
            Arg::new("poll-base")
                .long("poll-base")
                .takes_value(true)
                .help("Initial status poll interval in seconds"),
        )
        .arg(
            Arg::new("poll-max")
                .long("poll-max")
                .takes_value(true)
                .help("Maximum status poll interval in seconds"),
        )
        .arg(
            Arg::new("poll-multiplier")
                .long("poll-multiplier")
                .takes_value(true)
                .help("Backoff multiplier applied between polls"),
        )
        .arg(
            Arg::new("no_staple")
                .long("no-staple")
                .help("Skip stapling after acceptance"),
        )
        .arg(
            Arg::new("archive")
                .long("archive")
                .takes_value(true)
                .help("Where to write the submission archive (default: <input>.zip)"),
        )
        .arg(
            Arg::new("report")
                .long("report")
                .takes_value(true)
                .help("Write a JSON run report to this path"),
        )
        .arg(
            Arg::new("dry_run")
                .long("dry-run")
                .help("Scan and print discovered artifacts without signing"),
        );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    // This spews unwanted output at default level. Nerf it by default.
    if log_level == LevelFilter::Info {
        builder.filter_module("rustls", LevelFilter::Error);
    }

    builder.init();

    command_run(&matches)
}

fn main() {
    let exit_code = match main_impl() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    };

    std::process::exit(exit_code)
}
