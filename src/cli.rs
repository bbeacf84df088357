use crate::{
    config::AppConfig,
    error::OpResult,
    identity::identity_hash,
    library::{LibraryIndex, ModSortKey},
    logging,
    queue::{Channel, LockIntent, OpHandler},
};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

struct GlobalOptions {
    format: OutputFormat,
    channel: Option<String>,
    verbose: bool,
}

enum CliCommand {
    List { sort: ModSortKey, reverse: bool },
    Install(Vec<String>),
    Uninstall(Vec<String>),
    Clean(Vec<String>),
    Pack { ident: String, dest: PathBuf },
    Download(Vec<String>),
    Help,
    Version,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, tokens) = parse_global_options(&args);
    let command = parse_command(&tokens)?;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("modvault v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            logging::init(global.verbose);
            let config = AppConfig::load_or_create()?;
            let channel_config = config.select(global.channel.as_deref())?.clone();
            let channel = Channel::open(channel_config)?;
            run_command(&channel, command, global.format)
        }
    }
}

fn parse_global_options(args: &[String]) -> (GlobalOptions, Vec<String>) {
    let mut format = OutputFormat::Text;
    let mut channel = None;
    let mut verbose = false;
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            if let Some(parsed) = OutputFormat::parse(value) {
                format = parsed;
            }
            continue;
        }
        if arg == "--format" {
            if let Some(parsed) = iter.next().and_then(|value| OutputFormat::parse(value)) {
                format = parsed;
            }
            continue;
        }
        if let Some(value) = arg.strip_prefix("--channel=") {
            channel = Some(value.to_string());
            continue;
        }
        if arg == "--channel" {
            if let Some(value) = iter.next() {
                channel = Some(value.to_string());
            }
            continue;
        }
        if arg == "--verbose" || arg == "-v" {
            verbose = true;
            continue;
        }
        tokens.push(arg.to_string());
    }
    (
        GlobalOptions {
            format,
            channel,
            verbose,
        },
        tokens,
    )
}

fn parse_command(tokens: &[String]) -> Result<CliCommand> {
    let Some(head) = tokens.first() else {
        return Ok(CliCommand::Help);
    };
    let rest = tokens.get(1..).unwrap_or(&[]);
    let idents = || -> Result<Vec<String>> {
        if rest.is_empty() {
            bail!("{head} requires one or more mod identities");
        }
        Ok(rest.to_vec())
    };
    match head.as_str() {
        "list" => {
            let mut sort = ModSortKey::Name;
            let mut reverse = false;
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--sort" => {
                        let value = iter.next().context("--sort requires a value")?;
                        sort = parse_sort_key(value)?;
                    }
                    value if value.starts_with("--sort=") => {
                        sort = parse_sort_key(value.trim_start_matches("--sort="))?;
                    }
                    "--reverse" | "-r" => reverse = true,
                    other => bail!("Unknown list option: {other}"),
                }
            }
            Ok(CliCommand::List { sort, reverse })
        }
        "install" => Ok(CliCommand::Install(idents()?)),
        "uninstall" => Ok(CliCommand::Uninstall(idents()?)),
        "clean" => Ok(CliCommand::Clean(idents()?)),
        "download" => Ok(CliCommand::Download(idents()?)),
        "pack" => {
            let (Some(ident), Some(dest)) = (rest.first(), rest.get(1)) else {
                bail!("pack requires a mod identity and a destination archive");
            };
            Ok(CliCommand::Pack {
                ident: ident.to_string(),
                dest: PathBuf::from(dest),
            })
        }
        "help" | "--help" | "-h" => Ok(CliCommand::Help),
        "version" | "--version" | "-V" => Ok(CliCommand::Version),
        other => bail!("Unknown command: {other} (see 'modvault help')"),
    }
}

fn parse_sort_key(value: &str) -> Result<ModSortKey> {
    match ModSortKey::parse(value) {
        Some(key) => Ok(key),
        None => bail!("Unknown sort key: {value}"),
    }
}

fn run_command(channel: &Channel, command: CliCommand, format: OutputFormat) -> Result<()> {
    match command {
        CliCommand::List { sort, reverse } => {
            channel.with_library_mut(|library| library.sort_modpacks(sort, !reverse))?;
            channel.with_library(|library| print_mods(library, format))
        }
        CliCommand::Install(idents) => {
            let selection = resolve_idents(channel, &idents)?;
            let plan = channel.prepare_installs(&selection)?;
            for missing in &plan.missing_depends {
                println!("missing dependency: {missing}");
            }
            for name in &plan.conflicts {
                println!("conflict: {name}");
            }
            for name in &plan.overlaps {
                println!("overlaps installed: {name}");
            }
            run_queue(channel, LockIntent::ModOps, &plan.installs)
        }
        CliCommand::Uninstall(idents) => {
            let selection = resolve_idents(channel, &idents)?;
            let plan = channel.prepare_restores(&selection);
            run_queue(channel, LockIntent::ModOps, &plan.restores)
        }
        CliCommand::Clean(idents) => {
            let selection = resolve_idents(channel, &idents)?;
            let plan = channel.prepare_cleaning(&selection);
            channel.with_library(|library| {
                for hash in &plan.extra_depends {
                    if let Some(pkg) = library.find_by_hash(*hash) {
                        println!("also removing unused dependency: {}", pkg.identity);
                    }
                }
            });
            run_queue(channel, LockIntent::ModOps, &plan.restores)
        }
        CliCommand::Pack { ident, dest } => {
            let hash = identity_hash(&ident);
            let (method, level) = channel.with_library(|library| {
                let config = library.config();
                let method = if config.uses_directory_backups() {
                    8
                } else {
                    config.backup_method
                };
                (method, config.backup_level)
            });
            channel.with_library_mut(|library| -> Result<()> {
                let pkg = library
                    .find_by_hash_mut(hash)
                    .with_context(|| format!("unknown mod '{ident}'"))?;
                let mut quiet = |_: u64, _: u64| true;
                pkg.save_as(&dest, method, level, &mut quiet)
            })??;
            println!("packed {ident} into {}", dest.display());
            Ok(())
        }
        CliCommand::Download(idents) => {
            let repos = channel.with_library(|library| library.config().repositories.clone());
            if repos.is_empty() {
                bail!("channel has no repositories configured");
            }
            run_queue_targets(channel, &repos)?;
            let selection: Vec<u64> = idents.iter().map(|ident| identity_hash(ident)).collect();
            let plan = channel.prepare_downloads(&selection);
            for missing in &plan.missing_depends {
                println!("missing dependency: {missing}");
            }
            run_queue(channel, LockIntent::Download, &plan.downloads)
        }
        CliCommand::Help | CliCommand::Version => Ok(()),
    }
}

fn resolve_idents(channel: &Channel, idents: &[String]) -> Result<Vec<u64>> {
    channel.with_library(|library| {
        idents
            .iter()
            .map(|ident| {
                library
                    .find_by_identity(ident)
                    .map(|pkg| pkg.hash)
                    .with_context(|| format!("unknown mod '{ident}'"))
            })
            .collect()
    })
}

/// Prints one line per finished item.
struct CliReporter {
    labels: Vec<(u64, String)>,
    failed: AtomicBool,
}

impl CliReporter {
    fn label(&self, hash: u64) -> String {
        self.labels
            .iter()
            .find(|(known, _)| *known == hash)
            .map(|(_, label)| label.clone())
            .unwrap_or_else(|| format!("{hash:016x}"))
    }
}

impl OpHandler for CliReporter {
    fn on_begin(&self, hash: u64) {
        println!("{} ...", self.label(hash));
    }

    fn on_result(&self, hash: u64, result: OpResult) {
        if !result.is_ok() {
            self.failed.store(true, Ordering::Relaxed);
        }
        println!("{} {}", self.label(hash), result);
    }
}

fn labels_for(library: &LibraryIndex, hashes: &[u64]) -> Vec<(u64, String)> {
    hashes
        .iter()
        .map(|hash| {
            let label = library
                .find_by_hash(*hash)
                .map(|pkg| pkg.identity.clone())
                .or_else(|| library.find_net_by_hash(*hash).map(|pkg| pkg.identity.clone()))
                .unwrap_or_else(|| format!("{hash:016x}"));
            (*hash, label)
        })
        .collect()
}

fn run_queue(channel: &Channel, intent: LockIntent, hashes: &[u64]) -> Result<()> {
    if hashes.is_empty() {
        println!("nothing to do");
        return Ok(());
    }
    let reporter = Arc::new(CliReporter {
        labels: channel.with_library(|library| labels_for(library, hashes)),
        failed: AtomicBool::new(false),
    });
    let queued = match intent {
        LockIntent::Download => channel.queue_downloads(hashes, reporter.clone()),
        LockIntent::Supersede => channel.queue_supersedes(hashes, reporter.clone()),
        _ => channel.queue_mod_ops(hashes, reporter.clone()),
    };
    if !queued {
        bail!("library is busy");
    }
    channel.wait(intent);
    finish(channel, intent, &reporter)
}

fn run_queue_targets(channel: &Channel, urls: &[String]) -> Result<()> {
    let reporter = Arc::new(CliReporter {
        labels: urls.iter().map(|url| (identity_hash(url), url.clone())).collect(),
        failed: AtomicBool::new(false),
    });
    if !channel.queue_queries(urls, reporter.clone()) {
        bail!("repository queue is busy");
    }
    channel.wait(LockIntent::Query);
    finish(channel, LockIntent::Query, &reporter)
}

fn finish(channel: &Channel, intent: LockIntent, reporter: &CliReporter) -> Result<()> {
    if reporter.failed.load(Ordering::Relaxed) {
        bail!("{:?} finished with {}", intent, channel.exit_code(intent));
    }
    Ok(())
}

#[derive(Serialize)]
struct ModRow {
    identity: String,
    name: String,
    version: Option<String>,
    category: Option<String>,
    installed: bool,
    has_source: bool,
    missing_depend: bool,
    broken_depend: bool,
    overlapped: bool,
}

fn print_mods(library: &LibraryIndex, format: OutputFormat) -> Result<()> {
    let rows: Vec<ModRow> = library
        .modpacks()
        .iter()
        .map(|pkg| ModRow {
            identity: pkg.identity.clone(),
            name: pkg.display_name.clone(),
            version: pkg.version.as_ref().map(|version| version.to_string()),
            category: pkg.category.clone(),
            installed: pkg.is_installed(),
            has_source: pkg.has_source(),
            missing_depend: pkg.status.missing_depend,
            broken_depend: pkg.status.broken_depend,
            overlapped: pkg.status.overlapped,
        })
        .collect();
    if format == OutputFormat::Json {
        let raw = serde_json::to_string_pretty(&rows).context("serialize mod list")?;
        println!("{raw}");
        return Ok(());
    }
    if rows.is_empty() {
        println!("No mods in library");
        return Ok(());
    }
    for row in rows {
        let mut flags = Vec::new();
        if row.installed {
            flags.push("installed");
        }
        if !row.has_source {
            flags.push("no source");
        }
        if row.missing_depend {
            flags.push("missing deps");
        }
        if row.broken_depend {
            flags.push("broken deps");
        }
        if row.overlapped {
            flags.push("overlapped");
        }
        let version = row.version.unwrap_or_else(|| "-".to_string());
        println!("{:<40} {:<10} {}", row.identity, version, flags.join(", "));
    }
    Ok(())
}

fn print_help() {
    println!("modvault v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  modvault list [--sort <key>] [-r]   List mods (name|version|category|installed)");
    println!("  modvault install <ident...>         Install mods and their dependencies");
    println!("  modvault uninstall <ident...>       Restore target files, dependents first");
    println!("  modvault clean <ident...>           Uninstall plus unused dependencies");
    println!("  modvault pack <ident> <dest.zip>    Re-pack a mod source into an archive");
    println!("  modvault download <ident...>        Fetch mods from configured repositories");
    println!();
    println!("Global options:");
    println!("  --channel <name>                    Channel to operate on");
    println!("  --format <json|text>                Output format for list");
    println!("  -v, --verbose                       Debug logging");
    println!("  -h, --help                          Show help");
    println!("  -V, --version                       Show version");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn test_global_options_are_extracted() {
        let (global, tokens) =
            parse_global_options(&args(&["--channel", "Game", "list", "--format=json", "-v"]));
        assert_eq!(global.channel.as_deref(), Some("Game"));
        assert!(global.format == OutputFormat::Json);
        assert!(global.verbose);
        assert_eq!(tokens, args(&["list"]));
    }

    #[test]
    fn test_parse_commands() {
        assert!(matches!(
            parse_command(&args(&["list", "--sort", "version", "-r"])).unwrap(),
            CliCommand::List {
                sort: ModSortKey::Version,
                reverse: true
            }
        ));
        match parse_command(&args(&["install", "ModA", "ModB"])).unwrap() {
            CliCommand::Install(idents) => assert_eq!(idents, args(&["ModA", "ModB"])),
            _ => panic!("expected install"),
        }
        assert!(matches!(parse_command(&[]).unwrap(), CliCommand::Help));
        assert!(parse_command(&args(&["install"])).is_err());
        assert!(parse_command(&args(&["pack", "ModA"])).is_err());
        assert!(parse_command(&args(&["frobnicate"])).is_err());
        assert!(parse_command(&args(&["list", "--sort", "bogus"])).is_err());
    }
}
