use tokio::sync::mpsc;

pub type ProgressTx = mpsc::UnboundedSender<Progress>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    BoardFetched { name: String, cards: usize },
    PrivilegesGranted(usize),
    PrivilegesRevoked(usize),
    MilestonesFetched(usize),
    Card { index: usize, total: usize, title: String },
    CardErrors { card: String, errors: Vec<String> },
    Finished(RunReport),
    Status(String),
}

/// Totals for one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub created: usize,
    pub updated: usize,
    pub existing: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub errors: Vec<String>,
}

/// Print progress events to stdout until every sender is gone.
pub async fn render(mut rx: mpsc::UnboundedReceiver<Progress>) {
    while let Some(event) = rx.recv().await {
        match event {
            Progress::BoardFetched { name, cards } => {
                println!("Fetched board \"{name}\" ({cards} cards)");
            }
            Progress::PrivilegesGranted(n) => println!("Granted admin to {n} user(s)"),
            Progress::PrivilegesRevoked(n) => println!("Revoked admin from {n} user(s)"),
            Progress::MilestonesFetched(n) => println!("Fetched {n} milestone(s)"),
            Progress::Card {
                index,
                total,
                title,
            } => println!("[{}/{total}] {title}", index + 1),
            Progress::CardErrors { card, errors } => {
                println!("  {} error(s) on {card}", errors.len());
            }
            Progress::Finished(report) => {
                println!(
                    "Done: {} created, {} updated, {} already migrated, {} skipped",
                    report.created, report.updated, report.existing, report.skipped
                );
                if report.deleted > 0 {
                    println!("Deleted {} issue(s)", report.deleted);
                }
                if !report.errors.is_empty() {
                    println!("{} error(s):", report.errors.len());
                    for e in &report.errors {
                        println!("  - {e}");
                    }
                }
            }
            Progress::Status(line) => println!("  {line}"),
        }
    }
}
