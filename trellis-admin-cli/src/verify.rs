//! Diff-chain verification for stored files

use anyhow::{anyhow, Result};
use trellis_core::{Datastore, FileReport, MAX_DIFF_SEARCH};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct VerifySummary {
    pub verified: u64,
    pub errors: u64,
}

/// Check each file and print a JSON report per file. Fails if any file is
/// damaged or missing.
pub async fn verify_files(
    datastore: &Datastore,
    org: &str,
    repo: &str,
    file_ids: &[String],
    quiet: bool,
) -> Result<VerifySummary> {
    let summary = collect(datastore, org, repo, file_ids, |report| {
        if !quiet {
            match serde_json::to_string_pretty(report) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("  ERROR: can't render report for {}: {}", report.file_id, e),
            }
        }
    })
    .await?;

    println!("\nVerification:");
    println!("  Files verified: {}", summary.verified);
    println!("  Errors: {}", summary.errors);
    println!("  Max chain length: {}", MAX_DIFF_SEARCH);

    if summary.errors > 0 {
        return Err(anyhow!("Verification failed with {} errors", summary.errors));
    }
    Ok(summary)
}

async fn collect<F>(
    datastore: &Datastore,
    org: &str,
    repo: &str,
    file_ids: &[String],
    mut on_report: F,
) -> Result<VerifySummary>
where
    F: FnMut(&FileReport),
{
    let mut summary = VerifySummary::default();
    for file_id in file_ids {
        match datastore.verify_file(org, repo, file_id).await {
            Ok(report) => {
                if report.error.is_some() || !report.reaches_full {
                    summary.errors += 1;
                } else {
                    summary.verified += 1;
                }
                on_report(&report);
            }
            Err(trellis_core::Error::NotFound(message)) => {
                eprintln!("  ERROR: {}", message);
                summary.errors += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(summary)
}
