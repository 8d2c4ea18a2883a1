use jib_registry::manifest::Manifest;
use jib_registry::secrets::IDENTITY_TOKEN_USERNAME;
use jib_registry::{ClientConfig, ContentDigest, EndpointConfig, RegistryAuth, RegistryClient};

use clap::Parser;
use docker_credential::{CredentialRetrievalError, DockerCredential};
use tracing::{debug, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Pull a manifest, and optionally its config blob, from a container registry
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose mode
    #[clap(short, long)]
    verbose: bool,

    /// Perform anonymous operation, by default the tool tries to reuse the docker credentials read
    /// from the default docker file
    #[clap(short, long)]
    anonymous: bool,

    /// Allow self-signed certificates and plain HTTP when HTTPS is unavailable
    #[clap(short, long)]
    insecure: bool,

    /// Write the config blob of an image manifest to this file
    #[clap(short, long)]
    config_output: Option<String>,

    /// Registry host, e.g. `registry-1.docker.io` or `localhost:5000`
    registry: String,

    /// Repository to pull from, e.g. `library/busybox`
    image: String,

    /// Tag or digest
    #[clap(default_value = "latest")]
    reference: String,
}

fn build_auth(cli: &Cli) -> RegistryAuth {
    if cli.anonymous {
        return RegistryAuth::Anonymous;
    }

    match docker_credential::get_credential(&cli.registry) {
        Err(CredentialRetrievalError::ConfigNotFound) => RegistryAuth::Anonymous,
        Err(e) => panic!("Error handling docker configuration file: {}", e),
        Ok(DockerCredential::UsernamePassword(username, password)) => {
            debug!("Found docker credentials");
            RegistryAuth::Basic(username, password)
        }
        Ok(DockerCredential::IdentityToken(token)) => {
            debug!("Found docker identity token");
            RegistryAuth::Basic(IDENTITY_TOKEN_USERNAME.to_string(), token)
        }
    }
}

#[tokio::main]
pub async fn main() {
    let cli = Cli::parse();

    // setup logging
    let level_filter = if cli.verbose { "debug" } else { "info" };
    let filter_layer = EnvFilter::new(level_filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let endpoint =
        EndpointConfig::new(&cli.registry, &cli.image).expect("Not a valid registry or image");
    let config = ClientConfig {
        allow_insecure_registries: cli.insecure,
        ..ClientConfig::from_env()
    };
    let client = RegistryClient::new(endpoint, config).expect("Cannot create client");

    let auth = build_auth(&cli);
    let client = match client
        .registry_authenticator()
        .await
        .expect("Cannot probe the registry")
    {
        Some(authenticator) => {
            info!(realm = authenticator.realm(), "registry requires a bearer token");
            let authorization = authenticator
                .authenticate_pull(&auth)
                .await
                .expect("Cannot authenticate");
            client.with_authorization(Some(authorization))
        }
        None => client.with_authorization(auth.to_authorization()),
    };

    info!(image = %cli.image, reference = %cli.reference, "fetching manifest");
    let pulled = client
        .pull_manifest::<Manifest>(&cli.reference)
        .await
        .expect("Cannot pull manifest");
    println!("{}", pulled.digest);
    println!(
        "{}",
        serde_json::to_string_pretty(&pulled.manifest).expect("Cannot serialize manifest")
    );

    let (Some(output), Manifest::Image(manifest)) = (&cli.config_output, &pulled.manifest) else {
        return;
    };
    let digest: ContentDigest = manifest
        .config()
        .digest()
        .to_string()
        .parse()
        .expect("Not a valid config digest");
    let mut file = tokio::fs::File::create(output)
        .await
        .expect("Cannot create output file");
    let written = client
        .pull_blob(&digest)
        .write_to(&mut file)
        .await
        .expect("Cannot pull config blob");
    println!("Config blob ({} bytes) successfully written to {}", written, output);
}
