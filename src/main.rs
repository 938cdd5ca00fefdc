//! CLI entry point. Parses flags, assembles the plugin registry, and
//! drives either a build, a verify-only run, or a plugin listing.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo, missing_docs)]

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use secureblog_rs::config::{self, Cli, ExternalPluginSpec};
use secureblog_rs::error::BuildError;
use secureblog_rs::hermetic;
use secureblog_rs::integrity::Manifest;
use secureblog_rs::markdown::MarkdownOptions;
use secureblog_rs::pipeline::{self, BuildInputs};
use secureblog_rs::plugins::{FeedPlugin, MarkdownPlugin, SanitizePlugin, SitemapPlugin};
use secureblog_rs::registry::{Capability, RegistryBuilder};
use secureblog_rs::sandbox::{SandboxConfig, SandboxedPlugin};

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_target(false).init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            let code = err.exit_code();
            error!("{err}");
            eprintln!("{err}");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn run(cli: &Cli) -> Result<(), BuildError> {
    hermetic::scrub_environment();

    let config = config::load_config(&cli.config)?;

    if cli.verify_only {
        return verify(cli);
    }

    let registry = {
        let mut builder = RegistryBuilder::new();
        register_builtins(&mut builder, &config)?;
        register_external(&mut builder, cli)?;
        builder.build()
    };

    if cli.list_plugins {
        for descriptor in registry.descriptors() {
            let mut caps: Vec<String> = descriptor
                .capabilities
                .iter()
                .map(|c| format!("{c:?}"))
                .collect();
            caps.sort();
            println!(
                "{} {} priority={} capabilities=[{}]",
                descriptor.name,
                descriptor.version,
                descriptor.priority,
                caps.join(",")
            );
        }
        return Ok(());
    }

    if cli.output.exists() {
        fs::remove_dir_all(&cli.output).map_err(|e| BuildError::io(&cli.output, e))?;
    }
    fs::create_dir_all(&cli.output).map_err(|e| BuildError::io(&cli.output, e))?;

    let network_isolation_asserted = hermetic::assert_network_isolation();
    let (thread_pool, workers, workers_derived) = hermetic::build_thread_pool(&config);
    info!(workers, workers_derived, network_isolation_asserted, "hermetic runner initialised");

    let posts_dir = cli.content.join("posts");
    let static_dir = cli
        .content
        .parent()
        .map_or_else(|| PathBuf::from("static"), |p| p.join("static"));

    let inputs = BuildInputs {
        content_dir: &posts_dir,
        static_dir: &static_dir,
        output_dir: &cli.output,
        sign: cli.sign,
        network_isolation_asserted,
    };

    let build_info = pipeline::run(&registry, &config, &thread_pool, &inputs)?;
    info!(
        timestamp = build_info.timestamp,
        workers = build_info.workers,
        network_isolation_asserted = build_info.network_isolation_asserted,
        "build complete"
    );
    println!("build complete: {}", cli.output.display());
    Ok(())
}

fn register_builtins(
    builder: &mut RegistryBuilder,
    config: &config::Config,
) -> Result<(), BuildError> {
    let site_config = config.site_config();
    builder.register(Box::new(MarkdownPlugin::new(MarkdownOptions { autolink: config.autolink })))?;
    builder.register(Box::new(SanitizePlugin::default()))?;
    builder.register(Box::new(FeedPlugin::new(site_config.clone())))?;
    builder.register(Box::new(SitemapPlugin::new(site_config)))?;
    Ok(())
}

fn register_external(builder: &mut RegistryBuilder, cli: &Cli) -> Result<(), BuildError> {
    let plugin_config = config::load_plugin_config(cli.plugin_config.as_deref())?;
    for spec in plugin_config.plugins {
        let capabilities = capability_set(&spec)?;
        let sandbox_config = sandbox_config(&spec);
        builder.register(Box::new(SandboxedPlugin::new(
            spec.name,
            spec.priority,
            capabilities,
            sandbox_config,
        )))?;
    }
    Ok(())
}

fn capability_set(spec: &ExternalPluginSpec) -> Result<HashSet<Capability>, BuildError> {
    spec.capabilities.iter().map(|name| Capability::parse(name)).collect()
}

fn sandbox_config(spec: &ExternalPluginSpec) -> SandboxConfig {
    SandboxConfig {
        binary: spec.binary.clone(),
        uid: spec.uid,
        gid: spec.gid,
        timeout: std::time::Duration::from_secs(spec.timeout_secs),
        cpu_seconds: spec.cpu_seconds,
        memory_bytes: spec.memory_bytes,
        max_fds: spec.max_fds,
        scratch_dir: std::env::temp_dir(),
        plugin_config: spec.config.clone(),
    }
}

fn verify(cli: &Cli) -> Result<(), BuildError> {
    let manifest_path = cli.output.join(secureblog_rs::integrity::MANIFEST_FILENAME);
    let text = fs::read_to_string(&manifest_path).map_err(|e| BuildError::io(&manifest_path, e))?;
    let manifest = Manifest::parse(&text)?;
    match manifest.verify(&cli.output) {
        Ok(report) => {
            println!(
                "verify ok: {} files, 0 missing, 0 extra, 0 mismatched",
                report.missing.len() + report.extra.len() + report.mismatched.len()
            );
            Ok(())
        }
        Err(BuildError::Integrity(kind)) => {
            eprintln!("integrity: {kind}");
            Err(BuildError::Integrity(kind))
        }
        Err(other) => Err(other),
    }
}
