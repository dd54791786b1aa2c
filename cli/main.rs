#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::process;

use episim::config::StudyConfig;
use episim::dataset::{load_fit_data, write_dataset};
use episim::fit::{Family, FitOptions, ModelSpec, VarianceCriterion, fit_model};
use episim::montecarlo::{ReplicateSummary, TrueValues, run_monte_carlo};
use episim::outcome::simulate;

#[derive(Clone, Copy, ValueEnum)]
pub enum FamilyCli {
    Logistic,
    Poisson,
}

impl From<FamilyCli> for Family {
    fn from(family: FamilyCli) -> Self {
        match family {
            FamilyCli::Logistic => Family::Logistic,
            FamilyCli::Poisson => Family::Poisson,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CriterionCli {
    Restricted,
    MaximumLikelihood,
}

impl From<CriterionCli> for VarianceCriterion {
    fn from(criterion: CriterionCli) -> Self {
        match criterion {
            CriterionCli::Restricted => VarianceCriterion::Restricted,
            CriterionCli::MaximumLikelihood => VarianceCriterion::MaximumLikelihood,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "episim",
    about = "Simulate epidemiological cohorts and check how well regression models recover the truth",
    long_about = "Simulates individual-level binary or count outcomes from sex, age and optional \
                 cluster random intercepts, fits logistic/Poisson models with or without a random \
                 intercept, and summarizes estimator behaviour across Monte-Carlo replicates."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate one cohort from the [simulation] table of a study file
    #[command(about = "Simulate one dataset (outputs: data.tsv)")]
    Simulate {
        /// Path to the study TOML file
        config: PathBuf,

        /// Overrides the configured seed
        #[arg(long)]
        seed: Option<u64>,

        #[arg(long, default_value = "data.tsv")]
        output: PathBuf,
    },

    /// Fit a model to a tab-separated table with sex, age, outcome and optional cluster columns
    #[command(about = "Fit a model to a dataset (prints TOML)")]
    Fit {
        /// Path to the input TSV file
        data: PathBuf,

        #[arg(long, value_enum, default_value_t = FamilyCli::Logistic)]
        family: FamilyCli,

        /// Add a Gaussian random intercept per cluster
        #[arg(long)]
        random_intercept: bool,

        /// Objective for the random-intercept variance
        #[arg(long, value_enum, default_value_t = CriterionCli::Restricted)]
        criterion: CriterionCli,

        /// Maximum number of P-IRLS iterations
        #[arg(long, default_value = "50")]
        max_iterations: usize,
    },

    /// Run the Monte-Carlo study described by a study file
    #[command(about = "Replicate simulate-and-fit (outputs: summary.toml)")]
    Replicate {
        /// Path to the study TOML file
        config: PathBuf,

        /// Overrides the configured number of replicates
        #[arg(long)]
        replicates: Option<usize>,

        /// Overrides the configured seed
        #[arg(long)]
        seed: Option<u64>,

        /// Worker threads (0 uses all cores)
        #[arg(long)]
        threads: Option<usize>,

        /// Show a progress bar
        #[arg(long)]
        progress: bool,

        #[arg(long, default_value = "summary.toml")]
        output: PathBuf,
    },
}

#[derive(Serialize)]
struct ReplicationReport<'a> {
    base_seed: u64,
    replicates: usize,
    truth: &'a TrueValues,
    summary: &'a ReplicateSummary,
    excluded: Vec<ExcludedEntry<'a>>,
}

#[derive(Serialize)]
struct ExcludedEntry<'a> {
    index: usize,
    reason: &'a str,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Simulate {
            config,
            seed,
            output,
        }) => run_simulate(config, seed, output),
        Some(Commands::Fit {
            data,
            family,
            random_intercept,
            criterion,
            max_iterations,
        }) => run_fit(data, family, random_intercept, criterion, max_iterations),
        Some(Commands::Replicate {
            config,
            replicates,
            seed,
            threads,
            progress,
            output,
        }) => run_replicate(config, replicates, seed, threads, progress, output),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_simulate(
    config: PathBuf,
    seed: Option<u64>,
    output: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut study = StudyConfig::load(&config)?;
    if seed.is_some() {
        study.simulation.seed = seed;
    }
    let dataset = simulate(&study.simulation)?;
    let cases: u64 = dataset.individuals.iter().map(|i| i.outcome).sum();
    println!(
        "Simulated {} individuals (seed {}), total outcome {cases}.",
        dataset.individuals.len(),
        dataset
            .seed
            .map_or_else(|| "unrecorded".to_string(), |s| s.to_string())
    );
    if let Some(intercepts) = &dataset.cluster_intercepts {
        for (label, value) in intercepts {
            println!("  cluster {label}: intercept {value:.4}");
        }
    }
    write_dataset(&dataset, &output)?;
    println!("Dataset written to: {}", output.display());
    Ok(())
}

fn run_fit(
    data: PathBuf,
    family: FamilyCli,
    random_intercept: bool,
    criterion: CriterionCli,
    max_iterations: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let table = load_fit_data(&data)?;
    let spec = ModelSpec {
        family: family.into(),
        random_intercept,
    };
    let options = FitOptions {
        max_iterations,
        criterion: criterion.into(),
        ..FitOptions::default()
    };
    let result = fit_model(&table, &spec, &options)?;
    print!("{}", toml::to_string_pretty(&result)?);
    Ok(())
}

fn run_replicate(
    config: PathBuf,
    replicates: Option<usize>,
    seed: Option<u64>,
    threads: Option<usize>,
    progress: bool,
    output: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut study = StudyConfig::load(&config)?;
    if let Some(replicates) = replicates {
        study.monte_carlo.replicates = replicates;
    }
    if seed.is_some() {
        study.simulation.seed = seed;
    }
    if let Some(threads) = threads {
        study.monte_carlo.threads = threads;
    }
    study.monte_carlo.show_progress |= progress;

    let run = run_monte_carlo(&study.simulation, &study.monte_carlo)?;
    let report = ReplicationReport {
        base_seed: run.base_seed,
        replicates: study.monte_carlo.replicates,
        truth: &run.truth,
        summary: &run.summary,
        excluded: run
            .excluded
            .iter()
            .map(|e| ExcludedEntry {
                index: e.index,
                reason: &e.reason,
            })
            .collect(),
    };

    let summary = &run.summary;
    println!(
        "{} of {} replicates fitted (base seed {}).",
        summary.successful, report.replicates, run.base_seed
    );
    println!(
        "  sex effect: mean {:.4}, 95% range ({:.4}, {:.4}), true {:.4}",
        summary.sex_effect.empirical_mean,
        summary.sex_effect.lower_quantile,
        summary.sex_effect.upper_quantile,
        summary.sex_effect.true_value
    );
    println!(
        "  age effect: mean {:.4}, 95% range ({:.4}, {:.4}), true {:.4}",
        summary.age_effect.empirical_mean,
        summary.age_effect.lower_quantile,
        summary.age_effect.upper_quantile,
        summary.age_effect.true_value
    );
    if let Some(sd) = &summary.intercept_sd {
        println!(
            "  intercept sd: mean {:.4}, 95% range ({:.4}, {:.4}), true {:.4}",
            sd.empirical_mean, sd.lower_quantile, sd.upper_quantile, sd.true_value
        );
    }

    fs::write(&output, toml::to_string_pretty(&report)?)?;
    println!("Summary written to: {}", output.display());
    Ok(())
}
