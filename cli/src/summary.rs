use cellar_core::config::{Config, StoreSettings};
use cellar_core::engine::RunReport;
use cellar_core::models::{JobResult, JobStatus};
use console::style;

fn status_label(status: JobStatus) -> console::StyledObject<&'static str> {
	match status {
		JobStatus::Success => style("ok").green(),
		JobStatus::CleanupFailedNonfatal => style("ok*").yellow(),
		JobStatus::ProduceFailed => style("FAILED").red().bold(),
		JobStatus::UploadFailed => style("FAILED").red().bold(),
	}
}

fn seconds(result: &JobResult) -> f64 {
	result.duration().num_milliseconds() as f64 / 1000.0
}

pub fn human_bytes(bytes: u64) -> String {
	const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
	let mut value = bytes as f64;
	let mut unit = 0;
	while value >= 1024.0 && unit < UNITS.len() - 1 {
		value /= 1024.0;
		unit += 1;
	}
	if unit == 0 { format!("{bytes} B") } else { format!("{value:.1} {}", UNITS[unit]) }
}

pub fn print_report(report: &RunReport) {
	for result in report.results.values() {
		let detail = match (&result.remote_artifact_name, &result.error_detail) {
			(Some(name), None) => name.clone(),
			(Some(name), Some(err)) => format!("{name} ({err})"),
			(None, Some(err)) => err.clone(),
			(None, None) => String::new(),
		};
		let size = result.size_bytes.map(human_bytes).unwrap_or_default();
		println!(
			"{:>7}  {:<32} {:>6.1}s {:>10}  {}",
			status_label(result.status),
			result.identity,
			seconds(result),
			size,
			detail
		);
		for deleted in &result.deleted {
			println!("{:>7}  {:<32} {}", "", "", style(format!("- {deleted}")).dim());
		}
	}
	for skipped in &report.skipped {
		println!("{:>7}  {}", style("skipped").dim(), skipped);
	}

	let counts = report.counts();
	let failed = counts.produce_failed + counts.upload_failed;
	println!();
	println!(
		"{} succeeded, {} with cleanup warnings, {} failed, {} skipped",
		style(counts.success).green(),
		style(counts.cleanup_failed).yellow(),
		if failed > 0 { style(failed).red().bold() } else { style(failed) },
		counts.skipped
	);
}

pub fn print_targets(config: &Config) {
	let store = match &config.settings.store {
		StoreSettings::WebDav { url, .. } => format!("webdav {url}"),
		StoreSettings::Local { root } => format!("local {}", root.display()),
	};
	println!("store:    {store}");
	println!("parallel: {}", config.settings.parallel);
	println!();
	for target in &config.targets {
		println!(
			"{:<16} {:<32} keep {:<3} → {}",
			style(target.kind.as_str()).cyan(),
			target.identity,
			target.retention_count,
			target.destination_path
		);
	}
	println!();
	println!("{} target(s)", config.targets.len());
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bytes_are_humanized() {
		assert_eq!(human_bytes(512), "512 B");
		assert_eq!(human_bytes(1536), "1.5 KiB");
		assert_eq!(human_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
	}
}
