//! Configuração do runledger carregada a partir de `runledger.toml`.
//!
//! A struct [`RunledgerConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `RUNLEDGER_CONFIG` aponta para um arquivo alternativo.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::poller::PollConfig;
use crate::state_machine::{Budget, JobSpec};

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "runledger.toml";

/// Configuração de nível superior carregada de `runledger.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunledgerConfig {
    /// Limites e extensões de orçamento aplicados a novos jobs.
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Parâmetros do cliente de polling.
    #[serde(default)]
    pub polling: PollingConfig,

    /// Tempo máximo de execução de um estágio; `0` desativa o limite.
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
}

/// Limites padrão e valores concedidos a cada confirmação.
#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_limit_turns")]
    pub default_limit_turns: u64,

    #[serde(default = "default_limit_tokens")]
    pub default_limit_tokens: u64,

    /// Turnos adicionados ao limite quando um humano confirma.
    #[serde(default = "default_extension_turns")]
    pub extension_turns: u64,

    /// Tokens adicionados ao limite quando um humano confirma.
    #[serde(default = "default_extension_tokens")]
    pub extension_tokens: u64,
}

/// Intervalos e tolerâncias do polling.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Intervalo enquanto o job aguarda confirmação; ausente usa `interval_ms`.
    #[serde(default)]
    pub confirm_interval_ms: Option<u64>,

    /// Falhas consecutivas toleradas antes de reportar erro.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Espera após observar COMPLETED antes de navegar.
    #[serde(default = "default_completion_grace_ms")]
    pub completion_grace_ms: u64,

    /// Tempo máximo de uma leitura; estourar conta como falha transitória.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

// Valor padrão para o limite de turnos: 3.
fn default_limit_turns() -> u64 {
    3
}

// Valor padrão para o limite de tokens: 15000.
fn default_limit_tokens() -> u64 {
    15_000
}

fn default_extension_turns() -> u64 {
    3
}

fn default_extension_tokens() -> u64 {
    15_000
}

fn default_interval_ms() -> u64 {
    2_000
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_completion_grace_ms() -> u64 {
    1_500
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

// Valor padrão para o timeout de estágio: 10 minutos.
fn default_stage_timeout_ms() -> u64 {
    600_000
}

impl Default for RunledgerConfig {
    fn default() -> Self {
        Self {
            budget: BudgetConfig::default(),
            polling: PollingConfig::default(),
            stage_timeout_ms: default_stage_timeout_ms(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_limit_turns: default_limit_turns(),
            default_limit_tokens: default_limit_tokens(),
            extension_turns: default_extension_turns(),
            extension_tokens: default_extension_tokens(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            confirm_interval_ms: None,
            max_consecutive_failures: default_max_consecutive_failures(),
            completion_grace_ms: default_completion_grace_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl BudgetConfig {
    /// Constrói o orçamento inicial de um job, respeitando limites do próprio spec.
    pub fn budget_for(&self, spec: &JobSpec) -> Budget {
        Budget::new(
            spec.limit_turns.unwrap_or(self.default_limit_turns),
            spec.limit_tokens.unwrap_or(self.default_limit_tokens),
            self.extension_turns,
            self.extension_tokens,
        )
    }
}

impl PollingConfig {
    pub fn to_poll_config(&self) -> PollConfig {
        let interval = Duration::from_millis(self.interval_ms);
        PollConfig {
            interval,
            confirm_interval: self
                .confirm_interval_ms
                .map_or(interval, Duration::from_millis),
            max_consecutive_failures: self.max_consecutive_failures,
            completion_grace: Duration::from_millis(self.completion_grace_ms),
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
        }
    }
}

impl RunledgerConfig {
    /// Carrega a configuração de `RUNLEDGER_CONFIG` ou de `runledger.toml`.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        match std::env::var("RUNLEDGER_CONFIG") {
            Ok(path) if !path.is_empty() => Self::load_from(Path::new(&path)),
            _ => {
                let path = Path::new(CONFIG_FILE);
                if path.exists() {
                    Self::load_from(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Carrega a configuração de um caminho explícito.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = toml::from_str::<RunledgerConfig>(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Timeout de estágio, ou `None` quando desativado.
    pub fn stage_timeout(&self) -> Option<Duration> {
        (self.stage_timeout_ms > 0).then(|| Duration::from_millis(self.stage_timeout_ms))
    }
}
