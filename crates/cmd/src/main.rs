// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{path::PathBuf, time::Duration};

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use dlgate_app::AppConfig;
use dlgate_download::{HmacUrlSigner, UrlSigner};
use snafu::{ResultExt, Whatever, ensure_whatever};

mod build_info;

#[derive(Debug, Parser)]
#[clap(
name = "dlgate",
about = "Metered downloads and streamed archives",
author = build_info::AUTHOR,
version = build_info::FULL_VERSION)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Server(ServerArgs),
    CheckConfig(CheckConfigArgs),
    SignUrl(SignUrlArgs),
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    /// TOML configuration file. `DLGATE__*` variables override its values.
    #[arg(short, long, env = "DLGATE_CONFIG")]
    config: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> Result<AppConfig, Whatever> { AppConfig::load(self.config.as_deref()) }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Starts the dlgate server.
Examples:

dlgate server --config config/default.toml

")]
struct ServerArgs {
    #[command(flatten)]
    config: ConfigArgs,
}

impl ServerArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let app = self.config.load()?.open();
        app.run().await
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Validates the configuration and prints the effective settings as JSON.
Secrets are omitted.
Examples:

dlgate check-config --config config/default.toml

")]
struct CheckConfigArgs {
    #[command(flatten)]
    config: ConfigArgs,
}

impl CheckConfigArgs {
    fn run(&self) -> Result<(), Whatever> {
        let config = self.config.load()?;
        let rendered =
            serde_json::to_string_pretty(&config).whatever_context("Failed to render configuration")?;
        println!("{rendered}");
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Mints a presigned URL for a storage key with the configured secret.
Examples:

dlgate sign-url --config config/default.toml --ttl 1h acme/v1/bracket.stl

")]
struct SignUrlArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Lifetime of the URL, e.g. `15m`. Defaults to `download.presign.url_ttl`.
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    ttl:    Option<Duration>,
    /// Storage key of the object.
    key:    String,
}

impl SignUrlArgs {
    fn run(&self) -> Result<(), Whatever> {
        let presign = self.config.load()?.download.presign;
        ensure_whatever!(
            !presign.secret.is_empty(),
            "download.presign.secret must be set to mint URLs outside the server"
        );
        let ttl = self.ttl.unwrap_or(presign.url_ttl);
        let ttl = chrono::Duration::from_std(ttl).whatever_context("TTL out of range")?;
        let signer = HmacUrlSigner::new(presign.base_url, presign.secret);
        let url = signer
            .sign(&self.key, Utc::now() + ttl)
            .whatever_context("Failed to sign URL")?;
        println!("{}", url.url);
        eprintln!("expires at {}", url.expires_at.to_rfc3339());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    human_panic::setup_panic!();
    let cli = Cli::parse();
    match cli.commands {
        Commands::Server(args) => args.run().await,
        Commands::CheckConfig(args) => args.run(),
        Commands::SignUrl(args) => args.run(),
    }
}
