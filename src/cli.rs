//! Interface de linha de comando do runledger baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, demo)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use runledger::state_machine::JobKind;

/// runledger: acompanha jobs de pesquisa em estágios com orçamento e confirmação.
#[derive(Debug, Parser)]
#[command(name = "runledger", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho para um arquivo de configuração alternativo.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Tipo de job aceito pela CLI, mapeado para [`JobKind`] internamente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    /// Gera candidatos, faz backtest e seleciona o melhor.
    AutoBacktest,
    /// Execução multi-turno de agente limitada por orçamento.
    LabRun,
    /// Otimização de parâmetros.
    ParamOptimization,
}

impl From<KindArg> for JobKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::AutoBacktest => JobKind::AutoBacktest,
            KindArg::LabRun => JobKind::LabRun,
            KindArg::ParamOptimization => JobKind::ParamOptimization,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submete um job, acompanha por polling e pede confirmação quando o orçamento acaba.
    Run {
        /// Símbolo negociado (ex.: BTC-USDT-SWAP).
        symbol: String,

        /// Estratégia a ser avaliada.
        strategy: String,

        /// Tipo de job.
        #[arg(long, value_enum, default_value_t = KindArg::AutoBacktest)]
        kind: KindArg,

        /// Limite de turnos antes de exigir confirmação.
        #[arg(long)]
        limit_turns: Option<u64>,

        /// Limite de tokens antes de exigir confirmação.
        #[arg(long)]
        limit_tokens: Option<u64>,

        /// Confirma extensões de orçamento automaticamente.
        #[arg(long, default_value_t = false)]
        auto_confirm: bool,

        /// Sharpe mínimo exigido pelo gate final.
        #[arg(long, default_value_t = 1.0)]
        min_sharpe: f64,

        /// Duração simulada de cada estágio, em milissegundos.
        #[arg(long, default_value_t = 800)]
        stage_delay_ms: u64,
    },

    /// Executa um job de cada tipo em paralelo e mostra o histórico.
    Demo,
}
