//! Console output for matrices and run reports.

use crate::flavor::FlavorMatrix;
use crate::orchestrator::{AttemptState, RunReport};

/// Prints a summary of an orchestrated run.
pub fn print_summary(report: &RunReport) {
    println!();
    println!("Testrun Results ({}):", report.group);
    println!("  Total:        {}", report.total);
    println!("  Succeeded:    {}", console::style(report.succeeded).green());
    println!("  Failed:       {}", console::style(report.failed).red());

    if report.infra_errors > 0 {
        println!(
            "  Infra errors: {}",
            console::style(report.infra_errors).red().bold()
        );
    }

    if report.flaky > 0 {
        println!("  Flaky:        {}", console::style(report.flaky).yellow());
    }

    println!("  Duration:     {:?}", report.duration);

    for attempt in report.attempts.iter().filter(|a| a.state != AttemptState::Succeeded) {
        println!(
            "  {} {} (attempt {}): {}",
            console::style("✗").red(),
            attempt.testrun.name,
            attempt.attempt,
            attempt.error.as_deref().unwrap_or("did not complete")
        );
    }

    println!();
    if report.success() {
        println!("{}", console::style("All testruns succeeded!").green().bold());
    } else {
        println!("{}", console::style("Some testruns failed.").red().bold());
    }
}

/// Prints the instances of a matrix and the versions they use.
pub fn print_matrix(matrix: &FlavorMatrix) {
    println!("Expanded {} instances:", matrix.len());
    for instance in &matrix.instances {
        let name = instance
            .extended
            .as_ref()
            .map(|e| format!(" [{}]", e.name))
            .unwrap_or_default();
        println!("  {}{}", instance.dimension(), name);
        for pool in &instance.workers {
            println!(
                "    {} {} {}:{} ({})",
                console::style(&pool.name).dim(),
                pool.machine.machine_type,
                pool.machine.image.name,
                pool.machine.image.version,
                pool.architecture()
            );
        }
    }

    if !matrix.used_kubernetes_versions.is_empty() {
        println!();
        println!("Kubernetes versions:");
        for (provider, versions) in matrix.used_kubernetes_versions.iter() {
            let versions: Vec<&str> = versions.iter().map(|v| v.version.as_str()).collect();
            println!("  {}: {}", provider, versions.join(", "));
        }
    }

    if !matrix.used_machine_images.is_empty() {
        println!();
        println!("Machine images:");
        for (provider, images) in matrix.used_machine_images.iter() {
            for (image, versions) in images {
                let versions: Vec<String> = versions
                    .iter()
                    .map(|v| {
                        let archs: Vec<&str> = v.architectures.iter().map(String::as_str).collect();
                        format!("{} ({})", v.version, archs.join(", "))
                    })
                    .collect();
                println!("  {}/{}: {}", provider, image, versions.join(", "));
            }
        }
    }
}
