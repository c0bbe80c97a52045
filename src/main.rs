//! Command-line front end for the build core.

use clap::{Parser, Subcommand};
use dsynth::{
    catalog::Catalog,
    config::Config,
    error::{DsynthError, Result},
    port::Origin,
    stores::PackageStore,
    supervisor::Supervisor,
};
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use yansi::Paint;

#[derive(Debug, Parser)]
#[command(name = "dsynth", version, about = "Bulk package-build orchestrator")]
struct Cli {
    /// Root directory for the template, sandboxes and default stores.
    #[arg(short = 'B', long, default_value = "/build/synth")]
    build_base: PathBuf,

    /// Number of parallel worker slots (default: number of CPUs).
    #[arg(short = 'j', long)]
    workers: Option<usize>,

    /// Force a template rebuild even when it is marked good.
    #[arg(short = 'f', long)]
    force: bool,

    /// Keep dispatching work after a port fails.
    #[arg(
        short = 'k',
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    keep_going: bool,

    /// Port catalog produced by the recipe parser.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Host system image the sandboxes are assembled from.
    #[arg(long, default_value = "/")]
    system: PathBuf,

    /// Ports tree exposed at /xports inside the sandboxes.
    #[arg(long, default_value = "/usr/dports")]
    ports: PathBuf,

    /// Enable a shared compiler cache at /ccache.
    #[arg(long)]
    ccache: Option<PathBuf>,

    /// Template construction helper.
    #[arg(long)]
    template_script: Option<PathBuf>,

    /// Let running builds finish on SIGINT/SIGTERM instead of interrupting
    /// them.
    #[arg(long)]
    finish_running: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Build the listed ports (and everything they depend on).
    Build {
        /// Origins to build, `category/name[@flavor]`.
        #[arg(required = true)]
        ports: Vec<String>,
    },
    /// Show which catalog ports already have packages.
    Status,
    /// Tear down leftover sandbox mounts and directories.
    Cleanup {
        /// Also remove the template and the discrete copies.
        #[arg(long)]
        template: bool,
    },
    /// Build (or rebuild with -f) the shared template.
    PrepareSystem,
}

impl Cli {
    fn config(&self) -> Result<Config> {
        let mut builder = Config::builder()
            .build_base(&self.build_base)
            .system_path(&self.system)
            .ports_path(&self.ports)
            .keep_going(self.keep_going)
            .finish_running(self.finish_running);
        if let Some(workers) = self.workers {
            builder = builder.max_workers(workers);
        }
        if let Some(ccache) = &self.ccache {
            builder = builder.ccache_path(ccache);
        }
        if let Some(script) = &self.template_script {
            builder = builder.template_script(script);
        }
        builder.build()
    }

    fn catalog_path(&self) -> PathBuf {
        self.catalog.clone().unwrap_or_else(|| self.build_base.join("catalog.json"))
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err}", Paint::red("error:"));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let config = Arc::new(cli.config()?);
    let supervisor = Supervisor::new(config.clone());

    match &cli.command {
        Cmd::Build { ports } => {
            let requested = ports
                .iter()
                .map(|s| Origin::parse(s))
                .collect::<Result<Vec<_>>>()?;
            let catalog = Catalog::read(cli.catalog_path())?;
            let summary = supervisor.run(&catalog, &requested, cli.force)?;
            print!("{}", summary.render());
            if summary.signalled {
                return Err(DsynthError::Shutdown);
            }
            Ok(if summary.succeeded() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Cmd::Status => {
            let catalog = Catalog::read(cli.catalog_path())?;
            let packages = PackageStore::new(&config.packages_path);
            let mut present = 0usize;
            for record in &catalog.ports {
                let port = record.to_port();
                if packages.contains(&port) {
                    present += 1;
                    println!("{} {} ({})", Paint::green("pkg"), port.origin, port.pkgname());
                } else if let Some(reason) = &port.ignore {
                    println!("{} {} ({reason})", Paint::yellow("ign"), port.origin);
                } else {
                    println!("{} {} ({})", Paint::red("---"), port.origin, port.pkgname());
                }
            }
            println!("{present}/{} packages present", catalog.len());
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Cleanup { template } => {
            supervisor.cleanup(*template)?;
            Ok(ExitCode::SUCCESS)
        }
        Cmd::PrepareSystem => {
            let rebuilt = supervisor.prepare_system(cli.force)?;
            println!("template {}", if rebuilt { "rebuilt" } else { "already good" });
            Ok(ExitCode::SUCCESS)
        }
    }
}
