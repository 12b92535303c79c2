#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::error::Error;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use pestkit::config::{AnalysisConfig, ConfigOverrides, ReportConfig};
use pestkit::covariance::{CovarianceResult, compute_covariance};
use pestkit::identifiability::IdentifiabilityTable;
use pestkit::jco::{self, JacobianMatrix};
use pestkit::progress::ConsoleDecodeProgress;
use pestkit::residuals::ResidualTable;
use pestkit::sensitivity::{
    SensitivityResult, compute_observation_sensitivity, compute_parameter_sensitivity,
};
use pestkit::ControlFile;

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Args)]
pub struct RankingArgs {
    /// Number of entries to report; a negative value reports the lowest-ranked ones
    #[arg(long, value_name = "N", allow_negative_numbers = true)]
    pub top: Option<i64>,

    /// Only report entries belonging to this group
    #[arg(long, value_name = "GROUP")]
    pub group: Option<String>,

    /// Report the summed score of each group instead of individual entries
    #[arg(long)]
    pub by_group: bool,

    /// TOML file with [sensitivity] and [report] settings; flags take precedence
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct ParSenArgs {
    /// Path to the binary Jacobian (.jco) written by PEST
    #[arg(value_name = "JCO")]
    pub jco: PathBuf,

    /// PEST control file (.pst) holding observation weights and parameter groups
    #[arg(long, value_name = "PST")]
    pub pst: PathBuf,

    /// Ignore observations in groups whose name contains "regul"
    #[arg(long)]
    pub drop_regul: bool,

    /// Ignore observations in this group (repeatable)
    #[arg(long = "drop-group", value_name = "GROUP")]
    pub drop_groups: Vec<String>,

    /// Only use observations in this group (repeatable)
    #[arg(long = "keep-group", value_name = "GROUP")]
    pub keep_groups: Vec<String>,

    #[command(flatten)]
    pub ranking: RankingArgs,
}

#[derive(Args)]
pub struct ObSenArgs {
    /// Path to the binary Jacobian (.jco) written by PEST
    #[arg(value_name = "JCO")]
    pub jco: PathBuf,

    /// PEST control file (.pst) holding observation weights and groups
    #[arg(long, value_name = "PST")]
    pub pst: PathBuf,

    #[command(flatten)]
    pub ranking: RankingArgs,
}

#[derive(Args)]
pub struct IdentparArgs {
    /// Matrix output written by PEST's IDENTPAR utility
    #[arg(value_name = "IDENTPAR")]
    pub identpar: PathBuf,

    /// PEST control file (.pst) supplying parameter groups; without it groups are empty
    #[arg(long, value_name = "PST")]
    pub pst: Option<PathBuf>,

    #[command(flatten)]
    pub ranking: RankingArgs,
}

#[derive(Args)]
pub struct CorArgs {
    /// Path to the binary Jacobian (.jco) written by PEST
    #[arg(value_name = "JCO")]
    pub jco: PathBuf,

    /// PEST control file (.pst) holding observation weights
    #[arg(long, value_name = "PST")]
    pub pst: PathBuf,

    /// Residual file (.res or .rei) supplying the objective function
    #[arg(long, value_name = "RES")]
    pub res: PathBuf,

    /// Prefix for the .cov.tsv, .cor.tsv and .eig.tsv outputs (defaults to the JCO path)
    #[arg(long, value_name = "PREFIX")]
    pub out_prefix: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "pestkit",
    about = "Sensitivity, covariance and residual analysis of PEST calibration outputs",
    long_about = "Reads the binary Jacobian, control file and residual file written by PEST \
                 and reports parameter and observation sensitivities, the posterior parameter \
                 covariance with its correlation and eigenstructure, and residual statistics."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Rank parameters by composite sensitivity
    #[command(about = "Rank parameters by composite sensitivity (TSV on stdout)")]
    ParSen(ParSenArgs),

    /// Rank observations by composite sensitivity
    #[command(about = "Rank observations by composite sensitivity (TSV on stdout)")]
    ObSen(ObSenArgs),

    /// Rank parameters by IDENTPAR identifiability
    #[command(about = "Rank parameters by IDENTPAR identifiability (TSV on stdout)")]
    Identpar(IdentparArgs),

    /// Posterior parameter covariance, correlation and eigenvectors
    #[command(about = "Write covariance, correlation and eigen tables (outputs: .cov.tsv, .cor.tsv, .eig.tsv)")]
    Cor(CorArgs),

    /// Per-group residual statistics and objective-function contributions
    #[command(about = "Summarise residuals by observation group (TSV on stdout)")]
    ResStats {
        /// Residual file (.res or .rei)
        #[arg(value_name = "RES")]
        res: PathBuf,
    },

    /// Display version information
    #[command(about = "Display version information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::ParSen(args)) => run_par_sen(args),
        Some(Commands::ObSen(args)) => run_ob_sen(args),
        Some(Commands::Identpar(args)) => run_identpar(args),
        Some(Commands::Cor(args)) => run_cor(args),
        Some(Commands::ResStats { res }) => run_res_stats(&res),
        Some(Commands::Version) => {
            println!("pestkit {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|e| Box::new(e) as Box<dyn Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn read_jacobian(path: &Path) -> Result<JacobianMatrix, Box<dyn Error>> {
    let mut progress = ConsoleDecodeProgress::new(format!("Reading {}", path.display()));
    let jacobian = jco::decode_with_progress(path, &mut progress)
        .map_err(|e| format!("{}: {e}", path.display()))?;
    log::info!(
        "{}: {} observations x {} parameters",
        path.display(),
        jacobian.nobs(),
        jacobian.npar()
    );
    Ok(jacobian)
}

fn load_config(path: Option<&Path>) -> Result<AnalysisConfig, Box<dyn Error>> {
    match path {
        Some(path) => Ok(AnalysisConfig::load(path).map_err(|e| format!("{}: {e}", path.display()))?),
        None => Ok(AnalysisConfig::default()),
    }
}

fn run_par_sen(args: ParSenArgs) -> CliResult {
    let config = load_config(args.ranking.config.as_deref())?.merge(ConfigOverrides {
        drop_regularization: args.drop_regul,
        drop_groups: args.drop_groups,
        keep_groups: args.keep_groups,
        top: args.ranking.top,
        group: args.ranking.group,
        by_group: args.ranking.by_group,
    });

    let jacobian = read_jacobian(&args.jco)?;
    let control = ControlFile::load(&args.pst)?;
    let result = compute_parameter_sensitivity(
        &jacobian,
        control.observations(),
        control.parameters(),
        &config.sensitivity,
    )?;
    write_ranking(&result, &config.report, "parameter")
}

fn run_ob_sen(args: ObSenArgs) -> CliResult {
    let config = load_config(args.ranking.config.as_deref())?.merge(ConfigOverrides {
        top: args.ranking.top,
        group: args.ranking.group,
        by_group: args.ranking.by_group,
        ..Default::default()
    });

    let jacobian = read_jacobian(&args.jco)?;
    let control = ControlFile::load(&args.pst)?;
    let result = compute_observation_sensitivity(&jacobian, control.observations())?;
    write_ranking(&result, &config.report, "observation")
}

fn run_identpar(args: IdentparArgs) -> CliResult {
    let config = load_config(args.ranking.config.as_deref())?.merge(ConfigOverrides {
        top: args.ranking.top,
        group: args.ranking.group,
        by_group: args.ranking.by_group,
        ..Default::default()
    });

    let table = IdentifiabilityTable::load(&args.identpar)?;
    let control = args.pst.as_deref().map(ControlFile::load).transpose()?;
    let result = table.ranking(control.as_ref().map(ControlFile::parameters))?;
    write_ranking(&result, &config.report, "parameter")
}

fn tsv_writer<W: Write>(sink: W) -> csv::Writer<W> {
    csv::WriterBuilder::new().delimiter(b'\t').from_writer(sink)
}

fn write_ranking(result: &SensitivityResult, report: &ReportConfig, label: &str) -> CliResult {
    let filtered;
    let view = match &report.group {
        Some(group) => {
            filtered = result.filter_by_group(group);
            if filtered.is_empty() {
                log::warn!("No {label} belongs to group '{group}'");
            }
            &filtered
        }
        None => result,
    };

    let mut out = tsv_writer(io::stdout().lock());
    if report.by_group {
        out.write_record(["group", "score"])?;
        for sum in view.sum_by_group() {
            out.write_record([sum.group, sum.score.to_string()])?;
        }
    } else {
        out.write_record([label, "group", "score"])?;
        for entry in view.top_n(report.top.unwrap_or(0)) {
            out.write_record([
                entry.name.as_str(),
                entry.group.as_str(),
                entry.score.to_string().as_str(),
            ])?;
        }
    }
    out.flush()?;
    Ok(())
}

fn run_cor(args: CorArgs) -> CliResult {
    let jacobian = read_jacobian(&args.jco)?;
    let control = ControlFile::load(&args.pst)?;
    let residuals = ResidualTable::load(&args.res)?;
    let result = compute_covariance(&jacobian, control.observations(), &residuals)?;
    println!(
        "phi = {:.6e}, {} weighted observations, {} degrees of freedom",
        result.phi(),
        result.nonzero_weights(),
        result.degrees_of_freedom()
    );

    let prefix = args.out_prefix.unwrap_or_else(|| args.jco.with_extension(""));
    let with_suffix = |suffix: &str| {
        let mut name = prefix.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    };

    let cov_path = with_suffix(".cov.tsv");
    write_matrix(&cov_path, &result, CovarianceResult::covariance)?;
    let cor_path = with_suffix(".cor.tsv");
    write_matrix(&cor_path, &result, CovarianceResult::correlation)?;
    let eig_path = with_suffix(".eig.tsv");
    write_eigen(&eig_path, &result)?;

    for path in [&cov_path, &cor_path, &eig_path] {
        println!("Wrote {}", path.display());
    }
    Ok(())
}

fn write_matrix(
    path: &Path,
    result: &CovarianceResult,
    matrix: for<'a> fn(&'a CovarianceResult) -> ndarray::ArrayView2<'a, f64>,
) -> CliResult {
    let names = result.parameter_names();
    let mut out = tsv_writer(std::fs::File::create(path)?);
    out.write_record(std::iter::once("parameter").chain(names.iter().map(String::as_str)))?;
    for (name, row) in names.iter().zip(matrix(result).rows()) {
        out.write_record(std::iter::once(name.clone()).chain(row.iter().map(f64::to_string)))?;
    }
    out.flush()?;
    Ok(())
}

fn write_eigen(path: &Path, result: &CovarianceResult) -> CliResult {
    let names = result.parameter_names();
    let mut out = tsv_writer(std::fs::File::create(path)?);
    out.write_record(["index", "eigenvalue"].into_iter().chain(names.iter().map(String::as_str)))?;
    let vectors = result.eigenvectors();
    for (i, value) in result.eigenvalues().iter().enumerate() {
        let header = [(i + 1).to_string(), value.to_string()];
        out.write_record(header.into_iter().chain(vectors.column(i).iter().map(f64::to_string)))?;
    }
    out.flush()?;
    Ok(())
}

fn run_res_stats(path: &Path) -> CliResult {
    let table = ResidualTable::load(path)?;

    let mut out = tsv_writer(io::stdout().lock());
    out.write_record(["group", "quantity", "count", "mean", "std_dev", "min", "max", "range"])?;
    for stats in table.stats_all() {
        for (quantity, summary) in [
            ("residual", stats.residual),
            ("absolute_residual", stats.absolute_residual),
            ("weighted_residual", stats.weighted_residual),
        ] {
            out.write_record([
                stats.group.clone(),
                quantity.to_string(),
                summary.count.to_string(),
                summary.mean.to_string(),
                summary.std_dev.to_string(),
                summary.min.to_string(),
                summary.max.to_string(),
                summary.range.to_string(),
            ])?;
        }
    }
    out.flush()?;
    drop(out);

    println!();
    let mut out = tsv_writer(io::stdout().lock());
    out.write_record(["group", "phi", "percent"])?;
    for contribution in table.objective_contributions() {
        out.write_record([
            contribution.group,
            contribution.phi.to_string(),
            format!("{:.2}", contribution.percent),
        ])?;
    }
    out.flush()?;
    println!("total phi\t{}", table.phi());
    Ok(())
}
