use beatline::export::{self, ProgramAssignment};
use beatline::realtime::{
    MidirSender, ProgramCycles, RecordingSender, Scheduler, SchedulerUpdate, Session, SystemClock,
    TimeoutSender,
};
use beatline::{Config, Project};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "beatline")]
#[command(about = "Render MIDI programs to files or play them on a MIDI port", long_about = None)]
struct Cli {
    /// Engine configuration (RON). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a project to a Standard MIDI File
    Render {
        /// Project file (.ron)
        project: PathBuf,

        /// Output .mid path
        #[arg(short, long, default_value = "out.mid")]
        output: PathBuf,

        /// Seed for swing and humanization
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Play a project on a MIDI output port until it ends or Enter is pressed
    Play {
        /// Project file (.ron)
        project: PathBuf,

        /// Part of the port name to connect to; the first port otherwise
        #[arg(short, long)]
        port: Option<String>,

        /// Schedule into memory instead of a port
        #[arg(long)]
        dry_run: bool,

        /// Seed for swing and humanization
        #[arg(long)]
        seed: Option<u64>,
    },
    /// List MIDI output ports
    Ports,
    /// Give tracks of an existing MIDI file a leading program change
    Reexport {
        /// MIDI file to update
        input: PathBuf,

        /// Where to write the result; the input is replaced when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// TRACK:CHANNEL:PROGRAM, may be repeated
        #[arg(short = 'P', long = "program")]
        programs: Vec<ProgramAssignment>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Render {
            project,
            output,
            seed,
        } => {
            if let Some(seed) = seed {
                config.expressive.seed = seed;
            }
            let project = Project::load(&project)?;
            export::export_to_file(&project, &config, &output)?;
            println!("Wrote {}", output.display());
        }
        Commands::Play {
            project,
            port,
            dry_run,
            seed,
        } => {
            if let Some(seed) = seed {
                config.expressive.seed = seed;
            }
            play(&project, config, port.as_deref(), dry_run)?;
        }
        Commands::Ports => {
            let ports = MidirSender::port_names()?;
            if ports.is_empty() {
                println!("No MIDI output ports found");
            }
            for (i, name) in ports.iter().enumerate() {
                println!("{i}: {name}");
            }
        }
        Commands::Reexport {
            input,
            output,
            programs,
        } => {
            let bytes = std::fs::read(&input)?;
            let updated = export::reexport(&bytes, &programs)?;
            let target = output.unwrap_or(input);
            export::write_file(&target, &updated)?;
            println!("Wrote {}", target.display());
        }
    }

    Ok(())
}

fn play(
    path: &Path,
    config: Config,
    port: Option<&str>,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let project = Project::load(path)?;
    println!(
        "Playing \"{}\" at {} bpm, press Enter to stop",
        project.name, project.bpm
    );

    let source = ProgramCycles::new(project, config.clone());
    let mut scheduler = Scheduler::new(config.clone(), source);
    if dry_run {
        scheduler.arm(RecordingSender::new())?;
    } else {
        let output = MidirSender::open(port)?;
        println!("Output: {}", output.port_name());
        scheduler.arm(TimeoutSender::spawn(output, config.send_timeout())?)?;
    }

    let session = Session::spawn(scheduler, Box::new(SystemClock))?;
    let updates = session.updates();

    let (enter_tx, enter_rx) = crossbeam::channel::bounded(1);
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        let _ = enter_tx.send(());
    });

    loop {
        crossbeam::select! {
            recv(updates) -> update => match update {
                Ok(SchedulerUpdate::Finished(stats)) => {
                    println!(
                        "Finished: {} cycles, {} late, {} dropped",
                        stats.cycles_completed, stats.sent_late, stats.dropped
                    );
                    break;
                }
                Ok(SchedulerUpdate::Overload { cycle, late_events, level, .. }) => {
                    eprintln!("Cycle {cycle}: {late_events} events late, now {level}");
                }
                Ok(SchedulerUpdate::Fault { message, class }) => {
                    eprintln!("Fault [{class}]: {message}");
                }
                Ok(_) => {}
                Err(_) => break,
            },
            recv(enter_rx) -> _ => break,
        }
    }

    let end = session.stop();
    if end.panic.notes_released > 0 {
        println!("Released {} notes", end.panic.notes_released);
    }
    end.result?;
    Ok(())
}
