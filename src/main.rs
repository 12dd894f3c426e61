use std::{path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use enginetest::{
    adjudication::{AdjudicationRules, DrawRule, ResignRule},
    constraints::Constraints,
    prelude::*,
};

#[derive(Parser)]
#[command(name = "enginetest", version)]
#[command(about = "Play chess engines against each other and measure the difference")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fixed number of games, Elo estimate for every pair of engines
    Elo {
        /// Total number of games
        #[arg(long)]
        num_games: u64,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Sequential test of the first engine against the second
    Sprt {
        /// Elo of the alternative hypothesis
        #[arg(long, allow_negative_numbers = true)]
        elohyp: f64,
        /// Elo of the null hypothesis
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        elo0: f64,
        /// False positive rate
        #[arg(long, default_value_t = 0.05)]
        alpha: f64,
        /// False negative rate
        #[arg(long, default_value_t = 0.05)]
        beta: f64,
        /// BayesElo draw parameter
        #[arg(long, default_value_t = 200.0)]
        draw_elo: f64,
        /// Stop without a decision after this many games
        #[arg(long)]
        max_games: Option<u64>,
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Engine executables. Engines are named after their file stem
    #[arg(long, num_args = 1.., required = true, value_name = "PATH")]
    engines: Vec<PathBuf>,
    /// FEN/EPD or move-list opening file
    #[arg(long, value_name = "FILE")]
    openingbook: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = OpeningOrder::Random)]
    opening_order: OpeningOrder,
    /// Seed of the opening order
    #[arg(long)]
    seed: Option<u64>,
    /// Games played at the same time
    #[arg(long, default_value_t = 4)]
    concurrency: usize,
    /// Play each opening once instead of once per color
    #[arg(long)]
    no_repeat: bool,
    /// Time control, `base+increment` in seconds [env: TIME_CONTROL, default: 10+0.1]
    #[arg(long, value_name = "TC")]
    tc: Option<TimeControl>,
    /// Memory limit per engine, in MB (needs cgroup v2) [env: ENGINE_RAM_MB]
    #[arg(long, value_name = "MB")]
    engine_ram: Option<usize>,
    /// Run engines without memory containment when cgroups are unavailable
    #[arg(long)]
    allow_uncontained: bool,
    /// Draw after this many full moves, 0 for no limit
    #[arg(long, default_value_t = 150)]
    max_moves: u32,
    /// Never adjudicate quiet positions as draws
    #[arg(long)]
    no_draw_adjudication: bool,
    /// Resign once both engines agree on a score of at least this many centipawns
    #[arg(long, value_name = "CP")]
    resign_score: Option<i32>,
    /// Consecutive startup failures of an engine before giving up, 0 never gives up
    #[arg(long, default_value_t = 3)]
    max_startup_failures: u32,
    /// Directory of the game log
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
    /// Continue an interrupted run from its game log
    #[arg(long, value_name = "FILE")]
    resume: Option<PathBuf>,
    /// Also write a trace log file
    #[arg(long)]
    log: bool,
    /// Only print the final report
    #[arg(long)]
    quiet: bool,
}

impl CommonArgs {
    fn tournament_config(&self, mode: EvaluationMode) -> TournamentConfig {
        let mut config = TournamentConfig::new(mode, EngineConfig::from_paths(&self.engines))
            .with_opening_order(self.opening_order)
            .with_concurrency(self.concurrency)
            .with_repeat(!self.no_repeat)
            .with_max_startup_failures(self.max_startup_failures)
            .with_output_dir(&self.output_dir)
            .with_adjudication(AdjudicationRules {
                max_moves: self.max_moves,
                draw: (!self.no_draw_adjudication).then(DrawRule::default),
                resign: self.resign_score.map(|score| ResignRule {
                    score,
                    ..ResignRule::default()
                }),
            });
        if let Some(book) = &self.openingbook {
            config = config.with_opening_book(book);
        }
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        if let Some(log) = &self.resume {
            config = config.with_resume(log);
        }
        config
    }

    fn configuration(&self) -> Configuration {
        let env = Configuration::from_env();
        let mut configuration = env.with_verbose(!self.quiet);
        if self.log {
            configuration = configuration.with_log(true);
        }
        if self.allow_uncontained {
            configuration = configuration.with_allow_uncontained(true);
        }
        configuration
    }

    fn constraints(&self) -> Result<Constraints, TournamentError> {
        let mut builder = ConstraintsBuilder::from_env();
        if let Some(tc) = self.tc {
            builder = builder.with_time_control(tc);
        }
        if let Some(mb) = self.engine_ram {
            builder = builder.with_ram_per_engine(mb);
        }
        builder
            .build()
            .map_err(|e| TournamentError::Config(format!("{e:#}")))
    }
}

fn run(cli: Cli) -> anyhow::Result<TournamentReport> {
    let (mode, common) = match cli.command {
        Commands::Elo { num_games, common } => (EvaluationMode::Elo { num_games }, common),
        Commands::Sprt {
            elohyp,
            elo0,
            alpha,
            beta,
            draw_elo,
            max_games,
            common,
        } => {
            let params = SprtParameters {
                alpha,
                beta,
                draw_elo,
                max_games,
                ..SprtParameters::new(elo0, elohyp)
            };
            (EvaluationMode::Sprt(params), common)
        }
    };

    let config = common.tournament_config(mode);
    config.validate()?;
    let constraints = common.constraints()?;
    Tournament::new(config, common.configuration(), constraints).run()
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(report) => {
            println!("{report}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e
                .downcast_ref::<TournamentError>()
                .map_or(1, TournamentError::exit_code);
            ExitCode::from(code)
        }
    }
}
