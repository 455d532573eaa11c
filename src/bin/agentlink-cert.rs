use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use agentlink::security::trust::spki_fingerprint_from_pem_bytes;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Generate an identity (certificate + private key) in the agentlink keystore layout.
///
/// Defaults:
/// - ECDSA P-256 + SHA-256
/// - serverAuth + clientAuth EKUs (suitable for mTLS)
/// - self-signed, or issued by a freshly generated CA with `--with-ca`
/// - Key permissions 0600 (on Unix), cert 0644
#[derive(Parser, Debug)]
#[command(
    name = "agentlink-cert",
    version,
    about = "Generate keystore material for agentlink"
)]
struct Cli {
    /// DNS names / IP addresses placed in the subjectAltName (repeatable)
    #[arg(long = "name", default_values_t = vec!["localhost".to_string()])]
    names: Vec<String>,

    /// Common Name (CN)
    #[arg(long, default_value = "agentlink")]
    cn: String,

    /// Output certificate path
    #[arg(long, default_value = "pki/own/cert.pem")]
    out_cert: PathBuf,

    /// Output private key path
    #[arg(long, default_value = "pki/own/key.pem")]
    out_key: PathBuf,

    /// Issue the certificate from a new CA; the CA cert goes to the trusted dir
    #[arg(long, action = ArgAction::SetTrue)]
    with_ca: bool,

    /// Where the CA private key is written with --with-ca
    #[arg(long, default_value = "pki/ca/key.pem")]
    out_ca_key: PathBuf,

    /// Also write a copy of the (self-signed) cert into trusted/certs (useful for local loopback/dev)
    #[arg(long, action = ArgAction::SetTrue)]
    copy_to_trusted: bool,

    /// Trusted certificate directory
    #[arg(long, default_value = "pki/trusted/certs")]
    trusted_dir: PathBuf,

    /// Overwrite output files if they exist
    #[arg(long, action = ArgAction::SetTrue)]
    force: bool,
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            // 0755 for directories
            let perm = fs::Permissions::from_mode(0o755);
            fs::set_permissions(parent, perm).ok();
        }
    }
    Ok(())
}

fn write_file(path: &Path, contents: &[u8], mode: u32, force: bool) -> std::io::Result<()> {
    if path.exists() && !force {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} exists; use --force to overwrite", path.display()),
        ));
    }
    ensure_parent(path)?;
    let mut f = File::create(path)?;
    f.write_all(contents)?;
    #[cfg(unix)]
    {
        let perm = fs::Permissions::from_mode(mode);
        fs::set_permissions(path, perm)?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

fn leaf_params(cli: &Cli) -> anyhow::Result<CertificateParams> {
    let mut params = CertificateParams::new(cli.names.clone())?;
    params
        .distinguished_name
        .push(DnType::CommonName, cli.cn.clone());
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    Ok(params)
}

struct Generated {
    cert_pem: String,
    key_pem: String,
    ca: Option<(String, String)>,
}

fn generate(cli: &Cli) -> anyhow::Result<Generated> {
    let key = KeyPair::generate()?;
    if !cli.with_ca {
        let cert = leaf_params(cli)?.self_signed(&key)?;
        return Ok(Generated {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            ca: None,
        });
    }
    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, format!("{} CA", cli.cn));
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let ca_key = KeyPair::generate()?;
    let ca_cert = ca_params.self_signed(&ca_key)?;
    let cert = leaf_params(cli)?.signed_by(&key, &ca_cert, &ca_key)?;
    Ok(Generated {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        ca: Some((ca_cert.pem(), ca_key.serialize_pem())),
    })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let generated = generate(&cli)?;

    write_file(&cli.out_cert, generated.cert_pem.as_bytes(), 0o644, cli.force)?;
    write_file(&cli.out_key, generated.key_pem.as_bytes(), 0o600, cli.force)?;

    let mut trusted_written = None;
    if let Some((ca_pem, ca_key_pem)) = &generated.ca {
        let path = cli.trusted_dir.join("ca.pem");
        write_file(&path, ca_pem.as_bytes(), 0o644, cli.force)?;
        write_file(&cli.out_ca_key, ca_key_pem.as_bytes(), 0o600, cli.force)?;
        trusted_written = Some(path);
    } else if cli.copy_to_trusted {
        let path = cli.trusted_dir.join("self.pem");
        write_file(&path, generated.cert_pem.as_bytes(), 0o644, cli.force)?;
        trusted_written = Some(path);
    }

    // Compute and print SPKI fingerprint (SHA-256)
    let fp = spki_fingerprint_from_pem_bytes(generated.cert_pem.as_bytes())?;
    println!("Generated cert and key");
    println!("  cert: {}", cli.out_cert.display());
    println!("  key:  {}", cli.out_key.display());
    println!("  names: {}", cli.names.join(", "));
    println!("  spki_sha256: {}", fp);
    if let Some(path) = &trusted_written {
        println!("  trusted: {}", path.display());
    }
    println!(
        "\nAdd to agentlink.toml (example):\n[encryption]\nsearch_paths = [\".\"]\n  [encryption.paths]\n  own_certificate = \"{}\"\n  own_private_key = \"{}\"\n  trusted_cert_dir = \"{}\"\n",
        cli.out_cert.display(),
        cli.out_key.display(),
        cli.trusted_dir.display()
    );

    Ok(())
}
