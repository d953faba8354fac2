use apihub_db::{BootstrapReport, MigrationState, MigrationStatus};

const WIDTH: usize = 64;

/// Print the boxed bootstrap summary. `location` names where the
/// migrations were read from.
pub fn print_summary(report: &BootstrapReport, location: &str) {
    for line in render_summary(report, &shorten_home(location)) {
        println!("{line}");
    }
}

/// Print one row per migration plus a totals line.
pub fn print_status(statuses: &[MigrationStatus]) {
    for line in render_status(statuses) {
        println!("{line}");
    }
}

fn shorten_home(location: &str) -> String {
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => location.replace(&home, "~"),
        _ => location.to_string(),
    }
}

/// Cut `text` to `width` characters, ending in `…` when shortened.
fn fit(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut out: String = text.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn render_summary(report: &BootstrapReport, dir: &str) -> Vec<String> {
    let version = env!("CARGO_PKG_VERSION");
    let inner = WIDTH - 4; // "│ " + " │"

    let title = format!("APIHub v{version}");
    let title_dashes = WIDTH - 2 - title.len() - 5; // 2 for ╭╮, 5 for "─── " + " "
    let top = format!("╭─── {title} {}╮", "─".repeat(title_dashes));
    let bottom = format!("╰{}╯", "─".repeat(WIDTH - 2));
    let row = |text: &str| format!("│ {:<inner$} │", fit(text, inner));

    let migrations = &report.migrations;
    let attempts = report.probe_attempts;
    let probe = format!(
        "connected after {attempts} attempt{}",
        if attempts == 1 { "" } else { "s" }
    );

    let mut lines = vec![
        top,
        row(""),
        row("  Database ready"),
        row(&"─".repeat(inner - 2)),
        row(&format!("  Backend      {}", report.backend)),
        row(&format!("  Probe        {probe}")),
        row(&format!("  Applied      {}", migrations.applied().len())),
    ];
    for version in migrations.applied() {
        lines.push(row(&format!("    + {version}")));
    }
    lines.push(row(&format!(
        "  Up to date   {}",
        migrations.already_applied().len()
    )));
    if !migrations.healed().is_empty() {
        lines.push(row(&format!("  Healed       {}", migrations.healed().len())));
        for version in migrations.healed() {
            lines.push(row(&format!("    ~ {version}")));
        }
    }
    lines.push(row(&format!("  Migrations   {dir}")));
    lines.push(row(""));
    lines.push(bottom);
    lines
}

fn render_status(statuses: &[MigrationStatus]) -> Vec<String> {
    let version_w = statuses
        .iter()
        .map(|s| s.version.len())
        .max()
        .unwrap_or(0)
        .max("VERSION".len());

    let mut lines = vec![format!("{:<version_w$}  {:<9}  APPLIED AT", "VERSION", "STATE")];
    let mut pending = 0;
    let mut problems = 0;
    for status in statuses {
        let (label, applied_at) = match &status.state {
            MigrationState::Pending => {
                pending += 1;
                ("pending", None)
            }
            MigrationState::Applied { applied_at } => ("applied", Some(applied_at)),
            MigrationState::Legacy { applied_at } => ("legacy", Some(applied_at)),
            MigrationState::Drifted { applied_at, .. } => {
                problems += 1;
                ("drifted", Some(applied_at))
            }
            MigrationState::Orphaned { applied_at } => ("orphaned", Some(applied_at)),
        };
        let applied_at = applied_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        lines.push(format!(
            "{:<version_w$}  {label:<9}  {applied_at}",
            status.version
        ));
    }
    lines.push(format!(
        "{} migration(s), {pending} pending, {problems} drifted",
        statuses.len()
    ));
    lines
}
