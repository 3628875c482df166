//! CLI for preparing authenticated variable payloads at build time.

use anyhow::Context;
use clap::Parser;
use guid::Guid;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::x509::X509;
use std::path::PathBuf;
use uefi_specs::uefi::nvram::vars;
use uefi_specs::uefi::nvram::EfiVariableAttributes;
use uefi_specs::uefi::time::EFI_TIME;

/// Prepare an auth file for provisioning a secure variable.
///
/// The output file contains an EFI_VARIABLE_AUTHENTICATION_2 descriptor, a
/// PKCS#7 signature, and an EFI_SIGNATURE_LIST payload built from the given
/// certificates, suitable for passing to SetVariable verbatim.
#[derive(Parser)]
struct Args {
    /// Variable to target: PK, KEK, db, or dbx
    name: String,

    /// Output path
    output: PathBuf,

    /// One or more PEM certificates forming the signature list payload
    #[clap(required = true)]
    certs: Vec<PathBuf>,

    /// PEM private key to sign with (omit for setup-mode payloads)
    #[clap(short, long, requires = "cert")]
    key: Option<PathBuf>,

    /// PEM certificate matching --key
    #[clap(short, long, requires = "key")]
    cert: Option<PathBuf>,

    /// Signature owner GUID (defaults to the conventional owner for `name`)
    #[clap(long)]
    owner: Option<Guid>,

    /// Timestamp for the authenticated write, RFC 3339 (defaults to now)
    #[clap(long)]
    timestamp: Option<String>,
}

fn load_cert(path: &PathBuf) -> anyhow::Result<X509> {
    let pem = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    X509::from_pem(&pem).with_context(|| format!("parsing {}", path.display()))
}

fn load_key(path: &PathBuf) -> anyhow::Result<PKey<Private>> {
    let pem = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    PKey::private_key_from_pem(&pem).with_context(|| format!("parsing {}", path.display()))
}

fn efi_time_now() -> EFI_TIME {
    let now = time::OffsetDateTime::now_utc();
    EFI_TIME {
        year: now.year() as u16,
        month: u8::from(now.month()),
        day: now.day(),
        hour: now.hour(),
        minute: now.minute(),
        second: now.second(),
        ..EFI_TIME::ZEROED
    }
}

fn parse_timestamp(s: &str) -> anyhow::Result<EFI_TIME> {
    let t = time::OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339)
        .context("parsing --timestamp")?;
    let t = t.to_offset(time::UtcOffset::UTC);
    Ok(EFI_TIME {
        year: t.year() as u16,
        month: u8::from(t.month()),
        day: t.day(),
        hour: t.hour(),
        minute: t.minute(),
        second: t.second(),
        ..EFI_TIME::ZEROED
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let (vendor, _) = match args.name.as_str() {
        "PK" => vars::PK(),
        "KEK" => vars::KEK(),
        "db" => vars::DB(),
        "dbx" => vars::DBX(),
        other => anyhow::bail!("unsupported variable name: {other}"),
    };

    // PK conventionally lives under a platform-vendor owner; everything else
    // under the Microsoft owner GUID.
    let owner = args.owner.unwrap_or(match args.name.as_str() {
        "PK" => authgen::PLATFORM_VENDOR_GUID,
        _ => authgen::MICROSOFT_VENDOR_GUID,
    });

    let signer = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => Some((load_cert(cert)?, load_key(key)?)),
        _ => None,
    };

    let timestamp = match &args.timestamp {
        Some(s) => parse_timestamp(s)?,
        None => efi_time_now(),
    };

    let certs = args
        .certs
        .iter()
        .map(load_cert)
        .collect::<anyhow::Result<Vec<_>>>()?;

    let payload = authgen::certs_to_signature_lists(&certs, owner)?;

    let blob = authgen::signed_variable_update(
        &args.name,
        vendor,
        EfiVariableAttributes::DEFAULT_ATTRIBUTES_TIME_BASED_AUTH.into(),
        timestamp,
        &payload,
        signer.as_ref().map(|(c, k)| (c, k)),
    )?;

    std::fs::write(&args.output, &blob)
        .with_context(|| format!("writing {}", args.output.display()))?;

    tracing::info!(
        var = %args.name,
        output = %args.output.display(),
        len = blob.len(),
        signed = signer.is_some(),
        "wrote auth payload"
    );

    Ok(())
}
