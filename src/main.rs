//! aux-mcts: a chess MCTS engine with UCI helper engines.
//!
//! ## Usage
//!
//! - `aux-mcts` / `aux-mcts uci` - Start the UCI engine
//! - `aux-mcts search --fen <fen> --nodes 2000` - Search one position
//! - `aux-mcts selfplay --games 8` - Lockstep self-play with the material backend
//! - `aux-mcts scripted-engine --pv "e2e4 e7e5"` - Mock helper engine on stdin/stdout
//!
//! Logging goes to stderr (`RUST_LOG=debug` for details); stdout carries
//! the protocol.

use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use aux_mcts::backend::{Backend, MaterialBackend, UniformBackend};
use aux_mcts::constants::STARTPOS_FEN;
use aux_mcts::controller::EngineController;
use aux_mcts::fen::Diagram;
use aux_mcts::locks::LockToken;
use aux_mcts::params::{SearchParams, parse_engine_options};
use aux_mcts::scripted::ScriptedEngine;
use aux_mcts::search::{self, SearchLimits};
use aux_mcts::selfplay::{EvaluatorKind, MultiSelfPlayGames, Opening};
use aux_mcts::uci::UciEngine;

/// aux-mcts: chess MCTS with auxiliary UCI engines
#[derive(Parser)]
#[command(name = "aux-mcts")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Speak UCI on stdin/stdout
    Uci(EngineArgs),
    /// Search one position and print the result
    Search {
        #[command(flatten)]
        engine: EngineArgs,
        /// Position to search
        #[arg(long, default_value = STARTPOS_FEN)]
        fen: String,
        /// Moves played from the position, in UCI notation
        #[arg(long, num_args = 0.., value_delimiter = ' ')]
        moves: Vec<String>,
        /// Stop after this many playouts
        #[arg(long)]
        nodes: Option<u64>,
        /// Stop after this many milliseconds
        #[arg(long)]
        movetime: Option<u64>,
    },
    /// Play games between two copies of the material backend without search
    Selfplay {
        /// Number of games played in lockstep
        #[arg(long, default_value_t = 4)]
        games: usize,
        /// Pick moves by child value instead of policy
        #[arg(long)]
        value: bool,
        /// Noise added to backend values; varies the games picked by value
        #[arg(long, default_value_t = 0.1)]
        noise: f32,
    },
    /// Run the scripted mock helper engine on stdin/stdout
    ScriptedEngine {
        /// Fixed PV reported for every query
        #[arg(long)]
        pv: Option<String>,
        /// Report the first legal moves of the position instead, this many plies
        #[arg(long, default_value_t = 6)]
        first_legal: usize,
        #[arg(long, default_value_t = 20)]
        depth: u32,
        #[arg(long, default_value_t = 50_000)]
        nodes: u64,
        /// Longest time spent on a `go movetime`, in milliseconds
        #[arg(long, default_value_t = 0)]
        think_ms: u64,
    },
}

#[derive(Args, Clone, Default)]
struct EngineArgs {
    /// Primary search threads
    #[arg(long)]
    threads: Option<usize>,
    /// Evaluation backend: material or uniform
    #[arg(long, default_value = "material")]
    backend: String,
    /// Helper engine executable
    #[arg(long)]
    aux_engine: Option<PathBuf>,
    /// Arguments passed to the helper engine
    #[arg(long, num_args = 0.., allow_hyphen_values = true)]
    aux_args: Vec<String>,
    #[arg(long)]
    aux_instances: Option<usize>,
    /// Helper options, `Name=Value;Name2=Value2`
    #[arg(long)]
    aux_options: Option<String>,
    /// Options of helper 0, which then analyzes the root continuously
    #[arg(long)]
    aux_options_on_root: Option<String>,
    #[arg(long)]
    aux_time_ms: Option<u64>,
    #[arg(long)]
    aux_threshold: Option<u32>,
}

impl EngineArgs {
    fn params(&self) -> Result<SearchParams> {
        let mut params = SearchParams::default();
        if let Some(threads) = self.threads {
            params.threads = threads.max(1);
        }
        params.aux.path = self.aux_engine.clone();
        params.aux.args = self.aux_args.clone();
        if let Some(instances) = self.aux_instances {
            params.aux.instances = instances.max(1);
        }
        if let Some(options) = &self.aux_options {
            params.aux.options = parse_engine_options(options).context("--aux-options")?;
        }
        if let Some(options) = &self.aux_options_on_root {
            params.aux.options_on_root = parse_engine_options(options).context("--aux-options-on-root")?;
        }
        if let Some(time_ms) = self.aux_time_ms {
            params.aux.time_ms = time_ms.max(1);
        }
        if let Some(threshold) = self.aux_threshold {
            params.aux.threshold = threshold;
        }
        Ok(params)
    }

    fn backend(&self) -> Result<Arc<dyn Backend>> {
        match self.backend.as_str() {
            "material" => Ok(Arc::new(MaterialBackend::default())),
            "uniform" => Ok(Arc::new(UniformBackend)),
            other => bail!("unknown backend {other:?} (expected material or uniform)"),
        }
    }

    fn controller(&self) -> Result<EngineController> {
        Ok(EngineController::new(self.params()?, self.backend()?))
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();
    let cli = Cli::parse();

    match cli.command {
        None => run_uci(&EngineArgs {
            backend: "material".to_string(),
            ..EngineArgs::default()
        }),
        Some(Commands::Uci(engine)) => run_uci(&engine),
        Some(Commands::Search {
            engine,
            fen,
            moves,
            nodes,
            movetime,
        }) => run_search(&engine, &fen, &moves, nodes, movetime),
        Some(Commands::Selfplay { games, value, noise }) => run_selfplay(games, value, noise),
        Some(Commands::ScriptedEngine {
            pv,
            first_legal,
            depth,
            nodes,
            think_ms,
        }) => {
            let engine = match pv {
                Some(pv) => ScriptedEngine::fixed(&pv.split_whitespace().collect::<Vec<_>>(), depth, nodes),
                None => ScriptedEngine::first_legal(first_legal, depth, nodes),
            }
            .with_think(Duration::from_millis(think_ms));
            let input = io::stdin().lines().map_while(|line| line.ok());
            engine.run(input, io::stdout().lock()).context("scripted engine I/O")
        }
    }
}

fn run_uci(engine: &EngineArgs) -> Result<()> {
    let mut uci = UciEngine::new(engine.controller()?, io::stdout());
    uci.run(BufReader::new(io::stdin())).context("UCI loop")
}

fn run_search(engine: &EngineArgs, fen: &str, moves: &[String], nodes: Option<u64>, movetime: Option<u64>) -> Result<()> {
    let mut controller = engine.controller()?;
    let mut token = LockToken::new();
    let moves: Vec<&str> = moves.iter().map(String::as_str).collect();
    controller
        .set_position(&mut token, fen, &moves)
        .context("setting up the position")?;

    let limits = SearchLimits {
        nodes: nodes.or(movetime.is_none().then_some(2_000)),
        movetime: movetime.map(Duration::from_millis),
        infinite: false,
    };
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    controller.go(limits, Some(done_tx)).context("starting the search")?;
    // Workers signal once a limit is reached.
    let _ = done_rx.recv();

    let (pv, nodes_in_tree, diagram) = {
        let tree = controller.tree().read(&mut token);
        let pv: Vec<String> = search::principal_variation(&tree, 16).iter().map(ToString::to_string).collect();
        let diagram = Diagram(tree.history().last().board()).to_string();
        (pv, tree.live_nodes(), diagram)
    };
    let finished = controller.finish(&mut token).context("search failed")?;
    print!("{diagram}");
    match &finished.best {
        Some(best) => println!(
            "bestmove {} ({} visits, {} cp)",
            best.mv,
            best.visits,
            best.score_cp()
        ),
        None => println!("no move"),
    }
    println!("pv {}", pv.join(" "));
    println!("playouts {} | tree nodes {nodes_in_tree}", finished.playouts);
    println!("helpers: {}", finished.summary);
    Ok(())
}

fn run_selfplay(games: usize, value: bool, noise: f32) -> Result<()> {
    let backend: Arc<dyn Backend> = Arc::new(MaterialBackend::with_noise(noise));
    let openings = vec![Opening::startpos(); games.max(1)];
    let kind = if value { EvaluatorKind::Value } else { EvaluatorKind::Policy };
    let mut selfplay = MultiSelfPlayGames::new(Arc::clone(&backend), backend, &openings, kind)?;
    selfplay.play().context("self-play")?;
    for (i, (history, result)) in selfplay.histories().iter().zip(selfplay.results()).enumerate() {
        println!("game {i}: {result} after {} plies", history.len() - 1);
    }
    Ok(())
}
