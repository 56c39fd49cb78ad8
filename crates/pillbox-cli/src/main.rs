use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "pillbox-cli", version, about = "Pillbox CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Medication schedule management
    Schedule {
        #[command(subcommand)]
        action: commands::schedule::ScheduleAction,
    },
    /// Exact-time alarm planning
    Alarm {
        #[command(subcommand)]
        action: commands::alarm::AlarmAction,
    },
    /// Dose confirmation and history
    Dose {
        #[command(subcommand)]
        action: commands::dose::DoseAction,
    },
    /// Reconciliation sweep control
    Sweep {
        #[command(subcommand)]
        action: commands::sweep::SweepAction,
    },
    /// Sensor stream feed and detector state
    Sensor {
        #[command(subcommand)]
        action: commands::sensor::SensorAction,
    },
    /// Adherence statistics
    Stats {
        #[command(subcommand)]
        action: commands::stats::StatsAction,
    },
    /// Wipe all schedules, records and state
    Reset {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Schedule { action } => commands::schedule::run(action),
        Commands::Alarm { action } => commands::alarm::run(action),
        Commands::Dose { action } => commands::dose::run(action),
        Commands::Sweep { action } => commands::sweep::run(action),
        Commands::Sensor { action } => commands::sensor::run(action),
        Commands::Stats { action } => commands::stats::run(action),
        Commands::Reset { yes } => commands::reset::run(yes),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
