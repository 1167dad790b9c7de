extern crate dependency_scanner;

use anyhow::Context;
use clap::Parser;
use dependency_scanner::common::{decanonicalize, path_to_string, readable_canonical_path};
use dependency_scanner::models::{missing_modules, DependencyNode, DependencyTree};
use dependency_scanner::report::{missing_by_importer, MissingReport};
use dependency_scanner::scanner::{DependencyScanner, ScanProgress, ScanState};
use dependency_scanner::system::WindowsSystem;
use dependency_scanner::{LookupPath, ResolverConfig, ScanParameters};
use fs_err as fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Find every DLL needed by an executable, or by all the executables in a directory
#[derive(Parser, Debug)]
#[command(name = "depscan", version, about)]
struct Cli {
    /// Target file (.exe or .dll) or directory
    input: PathBuf,

    /// Descend into subdirectories when INPUT is a directory
    #[arg(short, long)]
    recursive: bool,

    /// Also follow the imports of system DLLs
    #[arg(short = 's', long)]
    include_system: bool,

    /// Worker threads for directory scans (1: scan sequentially)
    #[arg(short = 'j', long, default_value_t = 1)]
    jobs: usize,

    /// Maximum recursion depth
    #[arg(short = 'd', long, default_value_t = dependency_scanner::query::DEFAULT_MAX_DEPTH)]
    max_depth: usize,

    /// Windows partition to use for system DLLs lookup (default: the running system, if any)
    #[arg(short, long)]
    windows_root: Option<PathBuf>,

    /// Working directory to be considered in the DLL lookup path (default: current directory)
    #[arg(short = 'k', long)]
    workdir: Option<PathBuf>,

    /// Path for output in JSON format
    #[arg(long)]
    json: Option<PathBuf>,

    /// Write the list of missing DLLs to this file
    #[arg(long)]
    missing_report: Option<PathBuf>,

    /// Look up the DLLs listed in a missing-DLL report (e.g. from another machine) in this scan
    #[arg(long)]
    compare: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn print_node(node: &DependencyNode) {
    let location = if !node.exists {
        "not found".to_owned()
    } else if node.cycle_reference {
        "[cycle]".to_owned()
    } else {
        decanonicalize(&node.file_path)
    };
    let mut tags = Vec::new();
    if node.exists && !node.cycle_reference {
        tags.push(node.architecture.to_string());
    }
    if !node.file_version.is_empty() {
        tags.push(format!("v{}", node.file_version));
    }
    if node.arch_mismatch {
        tags.push("ARCH MISMATCH".to_owned());
    }
    if let Some(e) = &node.error {
        tags.push(format!("error: {e}"));
    }
    println!(
        "{}{} => {} {}",
        "\t".repeat(node.depth),
        node.file_name,
        location,
        if tags.is_empty() {
            String::new()
        } else {
            format!("[{}]", tags.join(", "))
        }
    );
}

fn print_forest(forest: &[DependencyTree]) {
    for tree in forest {
        println!();
        tree.visit_depth_first(print_node);
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if !cli.input.exists() {
        anyhow::bail!(
            "Specified file not found at {}\nCurrent working directory: {}",
            path_to_string(&cli.input),
            path_to_string(std::env::current_dir()?)
        );
    }

    let mut config = ResolverConfig::default();
    if let Some(root) = &cli.windows_root {
        config.system = WindowsSystem::from_root(root);
        if config.system.is_none() {
            warn!(
                "{} does not look like a Windows partition; system DLL imports will not be resolved",
                path_to_string(root)
            );
        }
    }
    match &config.system {
        Some(system) => {
            let dirs: Vec<String> = system.directories().iter().map(path_to_string).collect();
            info!("System directories: {}", dirs.join(", "));
        }
        None => info!("no Windows system directories available; system DLL imports will not be resolved"),
    }
    config.working_dir = cli.workdir.clone();

    let lookup_path = Arc::new(LookupPath::new(config));
    let parameters = ScanParameters {
        include_system_modules: cli.include_system,
        recursive: cli.recursive,
        max_depth: cli.max_depth,
        workers: cli.jobs.max(1),
    };
    let scanner = DependencyScanner::new(lookup_path, parameters).with_progress_callback(Arc::new(
        |p: &ScanProgress| info!("[{}/{}] {}", p.current, p.total, p.file_name),
    ));

    let report = if cli.input.is_dir() {
        let workers = scanner.parameters().workers;
        let res = if workers > 1 {
            scanner.scan_directory_parallel(&cli.input, workers)
        } else {
            scanner.scan_directory(&cli.input)
        };
        res.with_context(|| format!("could not scan {}", path_to_string(&cli.input)))?
    } else {
        let input = readable_canonical_path(&cli.input)?;
        if let Some(origin) = cli.input.parent() {
            let search_path: Vec<String> = scanner
                .lookup_path()
                .search_path(origin)
                .iter()
                .map(|e| decanonicalize(&path_to_string(e.get_path())))
                .collect();
            info!("Search path: {}", search_path.join(", "));
        }
        scanner
            .scan_file_report(&cli.input)
            .with_context(|| format!("could not scan {input}"))?
    };

    print_forest(&report.roots);

    let missing = missing_modules(&report.roots);
    println!();
    if missing.is_empty() {
        println!("No missing DLLs found!");
    } else {
        println!("Missing DLLs: {}", missing.len());
        for (dll, importers) in missing_by_importer(&report.roots) {
            println!("\t{} (imported by {})", dll, importers.join(", "));
        }
    }
    for p in &report.depth_limited {
        println!("Maximum depth reached at {}", path_to_string(p));
    }

    if let Some(json_output_path) = &cli.json {
        let js = serde_json::to_string_pretty(&report).context("Error serializing")?;
        fs::write(json_output_path, js)
            .with_context(|| format!("couldn't write to {}", json_output_path.display()))?;
        info!("successfully wrote to {}", json_output_path.display());
    }

    if let Some(report_path) = &cli.missing_report {
        MissingReport::from_forest(&report.roots)
            .save(report_path)
            .with_context(|| format!("couldn't write to {}", report_path.display()))?;
    }

    if let Some(compare_path) = &cli.compare {
        let other = MissingReport::load(compare_path)
            .with_context(|| format!("couldn't read {}", compare_path.display()))?;
        println!(
            "\nDLLs missing on {} (report of {}) found in this scan:",
            other.target_machine, other.generated_time
        );
        for location in other.locate_in(&report.roots) {
            let tree = &report.roots[location.tree];
            let chain: Vec<&str> = tree
                .ancestry(location.node)
                .iter()
                .map(|n| n.file_name.as_str())
                .collect();
            println!("\t{}", chain.join(" -> "));
        }
    }

    if report.state == ScanState::Cancelled {
        anyhow::bail!("scan cancelled");
    }

    Ok(())
}
