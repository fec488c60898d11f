//! Interface de terminal do runledger: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha visualmente
//! um job observado por polling.

use std::io;
use std::time::Duration;

use console::{Style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use runledger::state_machine::{JobSnapshot, JobStatus};
use runledger::PollOutcome;

/// Indicador visual de progresso para um job acompanhado por polling.
///
/// Exibe um spinner animado enquanto o job roda e mensagens
/// coloridas para sucesso (verde), falha (vermelho) e confirmação (amarelo).
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    /// Inicia o spinner com um rótulo para o job.
    pub fn start(label: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("PENDING: {label}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza a mensagem do spinner com o snapshot mais recente.
    pub fn update(&self, snapshot: &JobSnapshot) {
        self.pb.set_message(describe(snapshot));
    }

    /// Pergunta ao usuário se o orçamento deve ser estendido.
    ///
    /// O spinner fica suspenso durante a leitura do terminal.
    pub fn ask_confirm(&self, snapshot: &JobSnapshot) -> io::Result<bool> {
        self.pb.suspend(|| {
            let term = Term::stderr();
            let b = &snapshot.budget;
            term.write_line(&format!(
                "  {} Budget exhausted: {}/{} turns, {}/{} tokens",
                self.yellow.apply_to("!"),
                b.used_turns,
                b.limit_turns,
                b.used_tokens,
                b.limit_tokens
            ))?;
            term.write_str(&format!(
                "  Grant +{} turns / +{} tokens and continue? [y/N] ",
                b.extension_turns, b.extension_tokens
            ))?;
            let answer = term.read_line()?;
            Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
        })
    }

    /// Finaliza o spinner e exibe o resultado final do job.
    pub fn complete(&self, outcome: &PollOutcome) {
        self.pb.finish_and_clear();
        match outcome {
            PollOutcome::Completed(snapshot) => {
                println!("  {} Job completed", self.green.apply_to("✓"));
                if let Some(gate) = &snapshot.outputs.gate {
                    if gate.approved {
                        println!("  {} Gate approved", self.green.apply_to("✓"));
                    } else {
                        for reason in &gate.reasons {
                            println!("  {} Gate rejected: {reason}", self.red.apply_to("✗"));
                        }
                    }
                }
            }
            PollOutcome::Failed(snapshot) => {
                let reason = snapshot
                    .failure
                    .as_ref()
                    .map_or_else(|| "unknown".to_string(), ToString::to_string);
                println!("  {} Job failed: {reason}", self.red.apply_to("✗"));
            }
        }
    }

    /// Imprime o snapshot final formatado em JSON com estilo colorido.
    pub fn print_snapshot(&self, snapshot: &JobSnapshot) {
        let status_style = status_style(snapshot.status, &self.green, &self.red, &self.yellow);
        println!();
        println!("{}", status_style.apply_to("─── Job Snapshot ───"));
        println!(
            "{}",
            serde_json::to_string_pretty(snapshot).unwrap_or_default()
        );
    }
}

/// Imprime o histórico de jobs, um por linha.
pub fn print_history(snapshots: &[JobSnapshot]) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let yellow = Style::new().yellow();
    println!();
    println!("{}", Style::new().bold().apply_to("─── History ───"));
    for snap in snapshots {
        let (done, total) = snap.progress();
        println!(
            "  {:<8} {:<20} {:<14} {:<12} {done}/{total} stages, {} extension(s)",
            &snap.id[..8.min(snap.id.len())],
            snap.kind.to_string(),
            status_style(snap.status, &green, &red, &yellow).apply_to(snap.status),
            snap.symbol,
            snap.budget.extensions_granted,
        );
    }
}

fn status_style<'a>(status: JobStatus, green: &'a Style, red: &'a Style, yellow: &'a Style) -> &'a Style {
    match status {
        JobStatus::Completed => green,
        JobStatus::Failed => red,
        _ => yellow,
    }
}

/// Linha de status exibida no spinner.
fn describe(snapshot: &JobSnapshot) -> String {
    let (done, total) = snapshot.progress();
    let step = snapshot.current_step.as_deref().unwrap_or("-");
    let b = &snapshot.budget;
    format!(
        "{} [{done}/{total}] {step} · turns {}/{} · tokens {}/{}",
        snapshot.status, b.used_turns, b.limit_turns, b.used_tokens, b.limit_tokens
    )
}
