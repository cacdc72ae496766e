use devattest::appbins::{AppBin, AppRegistry};
use devattest::batch::{process_submissions, BatchDirs};
use devattest::config::{Config, SignerMode};
use devattest::device::{SharedSession, SoftwareDevice};
use devattest::firmware::FirmwareRegistry;
use devattest::protocol::provision;
use devattest::record::verification_url;
use devattest::rpc::{self, RpcClient, RpcServer};
use devattest::signer::{
    Authority, DeviceSigner, KeySigner, MessageSigner, RecordStore, SignerService,
    SigsumAuthority, VendorAuthority,
};
use devattest::sigsum::{LogClient, Policy, SigsumLog};
use devattest::time::{format_rfc3339, SystemTimeSource};
use devattest::transport::UreqTransport;
use devattest::udi::Udi;
use devattest::vendorkey::VendorKeys;
use devattest::verify::{RecordSource, Verifier};
use devattest::AttestError;

use devattest::reexports::log;

use clap::{crate_description, crate_name, crate_version, Arg, ArgAction, ArgMatches, Command};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_BASE_URL: &str = "https://tkey.tillitis.se/verify";

fn read_text(path: impl AsRef<Path>) -> Result<String, AttestError> {
    let path = path.as_ref();
    std::fs::read_to_string(path).map_err(|e| {
        AttestError::ConfigError(format!("Failed to read '{}': {}", path.display(), e))
    })
}

fn device_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("uds")
            .long("uds")
            .value_name("FILE")
            .required(true)
            .help("Device secret of the software device (hex)"),
    )
    .arg(
        Arg::new("udi")
            .long("udi")
            .value_name("HEX")
            .required(true)
            .help("UDI of the software device, big-endian hex"),
    )
    .arg(
        Arg::new("firmware")
            .long("firmware")
            .value_name("FILE")
            .required(true)
            .help("Firmware image of the software device"),
    )
}

fn apps_arg() -> Arg {
    Arg::new("apps")
        .long("apps")
        .value_name("DIR")
        .required(true)
        .help("Directory with <tag>.bin device apps and their .bin.sha512 digests")
}

fn firmwares_arg() -> Arg {
    Arg::new("firmwares")
        .long("firmwares")
        .value_name("FILE")
        .help("Known firmwares table, instead of the built-in one")
}

fn policy_arg() -> Arg {
    Arg::new("policy")
        .long("policy")
        .value_name("FILE")
        .help("Sigsum trust policy, instead of the built-in one")
}

fn config_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("config")
            .long("config")
            .short('c')
            .value_name("FILE")
            .required(true)
            .help("TOML configuration file"),
    )
    .arg(
        Arg::new("check_config")
            .long("check-config")
            .action(ArgAction::SetTrue)
            .help("Only check the configuration and exit"),
    )
}

/// Open the software device and make sure an interrupt closes it.
fn open_device(matches: &ArgMatches) -> Result<SharedSession, AttestError> {
    let uds = matches
        .get_one::<String>("uds")
        .ok_or(AttestError::UsageError("Missing device secret file"))?;
    let udi = matches
        .get_one::<String>("udi")
        .ok_or(AttestError::UsageError("Missing UDI"))?;
    let firmware = matches
        .get_one::<String>("firmware")
        .ok_or(AttestError::UsageError("Missing firmware file"))?;
    let session = SharedSession::new(SoftwareDevice::from_files(uds, udi, firmware)?);
    let handle = session.clone();
    ctrlc::set_handler(move || {
        handle.close();
        eprintln!("Interrupted");
        std::process::exit(1);
    })
    .map_err(|e| AttestError::InternalError(format!("Failed to install signal handler: {}", e)))?;
    Ok(session)
}

fn load_apps(matches: &ArgMatches) -> Result<AppRegistry, AttestError> {
    let dir = matches
        .get_one::<String>("apps")
        .ok_or(AttestError::UsageError("Missing apps directory"))?;
    let apps = AppRegistry::from_dir(dir)?;
    log::debug!("Device apps: {}", apps.tags().join(", "));
    Ok(apps)
}

fn load_firmwares(matches: &ArgMatches) -> Result<FirmwareRegistry, AttestError> {
    match matches.get_one::<String>("firmwares") {
        Some(path) => FirmwareRegistry::parse(&read_text(path)?),
        None => FirmwareRegistry::builtin(),
    }
}

fn load_policy(matches: &ArgMatches) -> Result<Policy, AttestError> {
    match matches.get_one::<String>("policy") {
        Some(path) => Policy::parse(&read_text(path)?),
        None => Policy::builtin(),
    }
}

fn load_sigsum(matches: &ArgMatches, keys_arg: &str, apps: &AppRegistry) -> Result<Option<SigsumLog>, AttestError> {
    let Some(path) = matches.get_one::<String>(keys_arg) else {
        return Ok(None);
    };
    let keys = devattest::sigsum::parse_submit_keys(&read_text(path)?, apps)?;
    Ok(Some(SigsumLog::new(keys, load_policy(matches)?)?))
}

fn load_vendor_keys(matches: &ArgMatches, apps: &AppRegistry) -> Result<Option<VendorKeys>, AttestError> {
    match matches.get_one::<String>("vendor_keys") {
        Some(path) => Ok(Some(VendorKeys::parse(&read_text(path)?, apps)?)),
        None => Ok(None),
    }
}

fn serve_signer(matches: &ArgMatches) -> Result<(), AttestError> {
    let config_file = matches
        .get_one::<String>("config")
        .ok_or(AttestError::UsageError("Missing config file"))?;
    let settings = Config::from_file(config_file)?.for_server()?;
    if matches.get_flag("check_config") {
        println!("Configuration OK ({:?} mode)", settings.mode);
        return Ok(());
    }

    let apps = load_apps(matches)?;
    let signer_app: AppBin = apps.get(&settings.vendor_app_hash)?.clone();
    let sigsum = match settings.mode {
        SignerMode::Signature => None,
        SignerMode::Sigsum | SignerMode::SigsumDeferred => Some(
            load_sigsum(matches, "submit_keys", &apps)?
                .ok_or(AttestError::UsageError("Sigsum mode needs --submit-keys"))?,
        ),
    };
    let expected = match &sigsum {
        None => {
            load_vendor_keys(matches, &apps)?
                .ok_or(AttestError::UsageError("Signature mode needs --vendor-keys"))?
                .get(&settings.vendor_app_hash)?
                .public_key
        }
        Some(log) => {
            log.keys()
                .find(|k| k.app_hash == settings.vendor_app_hash)
                .ok_or_else(|| {
                    AttestError::NotFound(format!("submit key for signer app {}", signer_app))
                })?
                .public_key
        }
    };

    let signer: Box<dyn MessageSigner> = match matches.get_one::<String>("signing_key") {
        Some(path) => {
            let signer = KeySigner::from_file(path)?;
            if signer.public_key() != expected {
                return Err(AttestError::ConfigError(
                    "signing key does not match the configured public key".to_string(),
                ));
            }
            log::warn!("Signing with an in-memory key instead of a device");
            Box::new(signer)
        }
        None => Box::new(DeviceSigner::open(open_device(matches)?, &signer_app, &expected)?),
    };

    let authority: Box<dyn Authority> = match sigsum {
        None => Box::new(VendorAuthority::new(signer)),
        Some(log) => Box::new(
            SigsumAuthority::new(
                signer,
                log,
                Box::new(UreqTransport::new()),
                settings.mode == SignerMode::SigsumDeferred,
            )?
            .with_log_url(settings.log_url.clone()),
        ),
    };
    let store = RecordStore::new(&settings.signatures_dir, &settings.submissions_dir);
    store.create_dirs()?;
    let service = SignerService::new(authority, store, Box::new(SystemTimeSource)).with_apps(apps);

    let tls = rpc::server_config(&settings.cacert, &settings.servercert, &settings.serverkey)?;
    let server = RpcServer::bind(&settings.listen, tls, Arc::new(service))?;
    server.serve()
}

fn remote_sign(matches: &ArgMatches) -> Result<(), AttestError> {
    let config_file = matches
        .get_one::<String>("config")
        .ok_or(AttestError::UsageError("Missing config file"))?;
    let settings = Config::from_file(config_file)?.for_client()?;
    if matches.get_flag("check_config") {
        println!("Configuration OK");
        return Ok(());
    }

    let apps = load_apps(matches)?;
    let app = match matches.get_one::<String>("app") {
        Some(tag) => apps.get_by_tag(tag)?,
        None => apps.latest_signer()?,
    };
    let firmwares = load_firmwares(matches)?;
    let tls = rpc::client_config(&settings.cacert, &settings.clientcert, &settings.clientkey)?;
    let client = RpcClient::connect(&settings.server, tls)?;

    let session = open_device(matches)?;
    let udi = session.udi()?;
    let kind = provision(&session, app, &firmwares, &client)?;
    println!("Remote signer stored a {} for device {}", kind.as_str(), udi.to_hex());
    Ok(())
}

fn verify(matches: &ArgMatches, verbose: bool) -> Result<(), AttestError> {
    let transport = UreqTransport::new();
    let source = match matches.get_one::<String>("base_dir") {
        Some(dir) => RecordSource::Dir(PathBuf::from(dir)),
        None => RecordSource::Url {
            base: matches
                .get_one::<String>("base_url")
                .map(|s| s.to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            transport: &transport,
        },
    };
    let apps = load_apps(matches)?;
    let firmwares = load_firmwares(matches)?;
    let vendor_keys = load_vendor_keys(matches, &apps)?;
    let sigsum = load_sigsum(matches, "submit_keys", &apps)?;

    let mut verifier = Verifier::new(&apps, &firmwares).require_proof(matches.get_flag("sigsum"));
    if let Some(keys) = &vendor_keys {
        verifier = verifier.with_vendor_keys(keys);
    }
    if let Some(log) = &sigsum {
        verifier = verifier.with_sigsum(log);
    }

    let session = open_device(matches)?;
    let verified = verifier.verify(&session, &source)?;
    if verbose {
        println!("Record:      {}", source.location(&verified.udi));
        println!("Timestamp:   {}", format_rfc3339(&verified.record.timestamp));
        println!("App:         {}", verified.record.app_tag);
        println!("Attested by: {}", verified.attested_by);
    }
    println!("Device {} is genuine ({})", verified.udi.to_hex(), verified.record.attestation.kind());
    Ok(())
}

fn submit(matches: &ArgMatches) -> Result<(), AttestError> {
    let dir = |name: &str| -> Result<PathBuf, AttestError> {
        matches
            .get_one::<String>(name)
            .map(PathBuf::from)
            .ok_or(AttestError::UsageError("Missing directory"))
    };
    let dirs = BatchDirs {
        submissions: dir("submissions")?,
        processed: dir("processed")?,
        verifications: dir("verifications")?,
    };
    let apps = load_apps(matches)?;
    let log = load_sigsum(matches, "keys", &apps)?
        .ok_or(AttestError::UsageError("Missing submit keys file"))?;
    let entry = log
        .policy()
        .logs()
        .first()
        .ok_or_else(|| AttestError::ConfigError("policy has no log".to_string()))?;
    let transport = UreqTransport::new();
    let client = LogClient::new(
        &transport,
        entry,
        matches.get_one::<String>("log_url").map(|s| s.as_str()),
    )?;
    let written = process_submissions(&dirs, &log, &client)?;
    println!("Wrote {} verification files", written.len());
    Ok(())
}

fn show_pubkey(matches: &ArgMatches) -> Result<(), AttestError> {
    let apps = load_apps(matches)?;
    let tag = matches
        .get_one::<String>("app")
        .ok_or(AttestError::UsageError("Missing app tag"))?;
    let app = apps.get_by_tag(tag)?;
    let session = open_device(matches)?;
    let guard = session.guard();
    let pk = guard.session().load_app(app)?;
    // the vendor key file format
    println!("{} {} {}", hex::encode(pk), app.tag(), hex::encode(app.hash()));
    Ok(())
}

fn start() -> Result<(), AttestError> {
    let matches = Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::SetTrue)
                .help("Verbose output"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .action(ArgAction::SetTrue)
                .help("Prints debugging information"),
        )
        .subcommand(
            device_args(config_args(
                Command::new("serve-signer").about("Run the vendor signing server"),
            ))
            .arg(apps_arg())
            .arg(
                Arg::new("vendor_keys")
                    .long("vendor-keys")
                    .value_name("FILE")
                    .help("Vendor public keys (signature mode)"),
            )
            .arg(
                Arg::new("submit_keys")
                    .long("submit-keys")
                    .value_name("FILE")
                    .help("Sigsum submit keys (Sigsum modes)"),
            )
            .arg(policy_arg())
            .arg(
                Arg::new("signing_key")
                    .long("signing-key")
                    .value_name("FILE")
                    .help("Sign with this key seed (hex) instead of a device"),
            )
            // the signing device is optional with --signing-key
            .mut_arg("uds", |a| a.required(false))
            .mut_arg("udi", |a| a.required(false))
            .mut_arg("firmware", |a| a.required(false)),
        )
        .subcommand(
            device_args(config_args(
                Command::new("remote-sign").about("Provision a device through the remote signer"),
            ))
            .arg(apps_arg())
            .arg(firmwares_arg())
            .arg(
                Arg::new("app")
                    .long("app")
                    .value_name("TAG")
                    .help("Signer app to load, defaults to the newest verisigner"),
            ),
        )
        .subcommand(
            device_args(Command::new("verify").about("Verify that a device is genuine"))
                .arg(apps_arg())
                .arg(firmwares_arg())
                .arg(
                    Arg::new("base_dir")
                        .long("base-dir")
                        .value_name("DIR")
                        .conflicts_with("base_url")
                        .help("Read the record from DIR/<udi hex> instead of the server"),
                )
                .arg(
                    Arg::new("base_url")
                        .long("base-url")
                        .value_name("URL")
                        .help("Base URL of the verification server"),
                )
                .arg(
                    Arg::new("vendor_keys")
                        .long("vendor-keys")
                        .value_name("FILE")
                        .help("Vendor public keys"),
                )
                .arg(
                    Arg::new("submit_keys")
                        .long("submit-keys")
                        .value_name("FILE")
                        .help("Sigsum submit keys"),
                )
                .arg(policy_arg())
                .arg(
                    Arg::new("sigsum")
                        .long("sigsum")
                        .action(ArgAction::SetTrue)
                        .help("Demand a Sigsum proof"),
                ),
        )
        .subcommand(
            Command::new("show-url")
                .about("Print the URL of a device's verification record")
                .arg(
                    Arg::new("udi")
                        .long("udi")
                        .value_name("HEX")
                        .required(true)
                        .help("Device UDI, big-endian hex"),
                )
                .arg(
                    Arg::new("base_url")
                        .long("base-url")
                        .value_name("URL")
                        .default_value(DEFAULT_BASE_URL)
                        .help("Base URL of the verification server"),
                ),
        )
        .subcommand(
            Command::new("submit")
                .about("Log deferred Sigsum submissions and write verification files")
                .arg(
                    Arg::new("submissions")
                        .short('m')
                        .long("submissions")
                        .value_name("DIR")
                        .required(true)
                        .help("Submissions directory"),
                )
                .arg(
                    Arg::new("processed")
                        .short('p')
                        .long("processed")
                        .value_name("DIR")
                        .required(true)
                        .help("Processed submissions directory, must be empty"),
                )
                .arg(
                    Arg::new("verifications")
                        .short('d')
                        .long("verifications")
                        .value_name("DIR")
                        .required(true)
                        .help("Verification files directory, must be empty"),
                )
                .arg(
                    Arg::new("keys")
                        .long("keys")
                        .value_name("FILE")
                        .required(true)
                        .help("Sigsum submit keys"),
                )
                .arg(apps_arg())
                .arg(policy_arg())
                .arg(
                    Arg::new("log_url")
                        .long("log-url")
                        .value_name("URL")
                        .help("Log URL, instead of the one in the policy"),
                ),
        )
        .subcommand(
            device_args(Command::new("show-pubkey").about("Print the public key of an app on a device"))
                .arg(apps_arg())
                .arg(
                    Arg::new("app")
                        .long("app")
                        .value_name("TAG")
                        .required(true)
                        .help("App tag"),
                ),
        )
        .subcommand(
            Command::new("show-firmwares")
                .about("List the known firmwares")
                .arg(firmwares_arg()),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let debug = matches.get_flag("debug");

    env_logger::builder()
        .format_timestamp(None)
        .format_level(false)
        .format_module_path(false)
        .format_target(false)
        .filter_level(if debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    match matches.subcommand() {
        Some(("serve-signer", m)) => serve_signer(m),
        Some(("remote-sign", m)) => remote_sign(m),
        Some(("verify", m)) => verify(m, verbose),
        Some(("show-url", m)) => {
            let udi = m
                .get_one::<String>("udi")
                .ok_or(AttestError::UsageError("Missing UDI"))?;
            let base = m
                .get_one::<String>("base_url")
                .ok_or(AttestError::UsageError("Missing base URL"))?;
            println!("{}", verification_url(base, &Udi::from_hex(udi)?));
            Ok(())
        }
        Some(("submit", m)) => submit(m),
        Some(("show-pubkey", m)) => show_pubkey(m),
        Some(("show-firmwares", m)) => {
            for line in load_firmwares(m)?.list() {
                println!("{line}");
            }
            Ok(())
        }
        _ => Err(AttestError::UsageError("No subcommand given")),
    }
}

fn main() -> Result<(), AttestError> {
    let res = start();
    match res {
        Ok(_) => {}
        Err(e) => {
            eprintln!("{}: {e}", e.class());
            std::process::exit(1);
        }
    }
    Ok(())
}
