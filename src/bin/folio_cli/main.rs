//! folio-cli: submit a Markdown document to a folio server and save the PDF.
#![deny(clippy::all, clippy::pedantic)]

mod args;
mod client;

use std::collections::BTreeMap;

use clap::Parser;
use folio_api_types::{Base64Bytes, ConvertRequest};

use args::{Cli, Commands, ConvertArgs};
use client::{CliError, Ctx, build_ctx_from_cli, read_file, write_file};

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let ctx = build_ctx_from_cli(&cli)?;

    match cli.command {
        Commands::Convert(args) => convert(&ctx, &args).await?,
    }

    Ok(())
}

fn build_request(args: &ConvertArgs) -> Result<ConvertRequest, CliError> {
    let input = read_file(&args.input)?;
    let mut resources = BTreeMap::new();
    for resource in &args.resources {
        resources.insert(
            resource.name.clone(),
            Base64Bytes::from(read_file(&resource.path)?),
        );
    }

    Ok(ConvertRequest {
        input: Some(Base64Bytes::from(input)),
        resources: (!resources.is_empty()).then_some(resources),
        template: Some(args.template.clone()),
    })
}

async fn convert(ctx: &Ctx, args: &ConvertArgs) -> Result<(), CliError> {
    let request = build_request(args)?;
    let response = ctx.convert(&request).await?;
    write_file(&args.output, response.content.as_slice())?;
    println!(
        "wrote {} bytes to {}",
        response.content.as_slice().len(),
        args.output.display()
    );
    Ok(())
}
