//! Validates an IPNS record locally and submits it to a relay's `/broadcast` endpoint.

use anyhow::{Context, Result};
use clap::Parser;
use ipns_publisher::Validator;
use reqwest::header::AUTHORIZATION;
use serde_json::json;
use url::Url;

#[derive(Parser, Debug)]
#[command(about)]
struct Cli {
    /// The IPNS key, a multibase encoded libp2p-key CID.
    key: String,
    /// The serialized record, base64 (padded) encoded.
    record: String,
    /// The relay's broadcast url, e.g. `http://localhost:8000/broadcast`.
    #[clap(long, env = "PUBLISHER_ENDPOINT_URL")]
    endpoint: Url,
    /// Sent as the `Authorization` header.
    #[clap(long, env = "PUBLISHER_AUTH_SECRET", hide_env_values = true)]
    auth_secret: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let update = Validator::default()
        .admit(&args.key, &args.record)
        .context("record failed validation")?;

    println!("Value:\n{}\n", update.value);
    println!("Expires:\n{}\n", update.decoded.validity().to_rfc3339());
    println!("Sequence:\n{}\n", update.decoded.sequence());
    println!("Decoded record:\n{:#?}\n", update.decoded);
    println!("Publishing to:\n{}\n", args.endpoint);

    let response = reqwest::Client::new()
        .post(args.endpoint)
        .header(AUTHORIZATION, args.auth_secret)
        .json(&json!({ "key": args.key, "record": args.record }))
        .send()
        .await?;

    println!("Response:\n{}", response.status().as_u16());
    println!("{}", response.text().await?);

    Ok(())
}
