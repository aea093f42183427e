//! Batch script text for one job.

use std::path::Path;

use crate::state_machine::JobSpec;

/// Renders the batch script for `spec`.
///
/// The result may still contain `%[name]` placeholders; the caller resolves
/// them against the job's macro table. A missing program binary makes the
/// script exit non-zero with a diagnostic.
pub fn render(spec: &JobSpec, unique_name: &str, output_path: &Path) -> String {
    let output = output_path.display();
    let workdir = output_path
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| ".".to_string());

    let mut header = vec![
        "#!/bin/bash".to_string(),
        format!("#SBATCH -J {unique_name}"),
        format!("#SBATCH -o {output}"),
        format!("#SBATCH -e {output}"),
        format!("#SBATCH -p {}", spec.queue),
        format!("#SBATCH -t {}", spec.time),
        format!("#SBATCH -N {}", spec.nodes),
        format!("#SBATCH --tasks-per-node {}", spec.ppn),
    ];
    if !spec.account.is_empty() {
        header.push(format!("#SBATCH -A {}", spec.account));
    }
    header.extend(spec.sbatch.iter().map(|d| format!("#SBATCH {d}")));

    let invocation = [
        format!("cd {workdir}"),
        format!("program={}/{}", spec.program_dir.display(), spec.program_name),
        "if [ ! -f \"$program\" ] ; then".to_string(),
        "  echo \"Program does not exist: $program\"".to_string(),
        "  exit 1".to_string(),
        "fi".to_string(),
        format!("{}$program", spec.runner),
    ];

    let mut script = header.join("\n");
    script.push_str("\n\n");
    script.push_str(&modules_block(spec.modules.as_deref()));
    script.push_str(&env_block(&spec.env));
    script.push_str(&thread_block(spec.threads));
    script.push_str(&invocation.join("\n"));
    script
}

fn modules_block(modules: Option<&str>) -> String {
    match modules {
        Some(m) if !m.trim().is_empty() && m != "default" => {
            format!("## custom modules\nmodule reset\nmodule load {m}\n")
        }
        _ => String::new(),
    }
}

fn env_block(env: &[(String, String)]) -> String {
    if env.is_empty() {
        return String::new();
    }
    let exports: String = env
        .iter()
        .map(|(name, value)| format!("export {name}=\"{value}\"\n"))
        .collect();
    format!("## environment\n{exports}")
}

fn thread_block(threads: i32) -> String {
    let count = match threads {
        0 => return String::new(),
        t if t > 0 => t.to_string(),
        _ => "$(( SLURM_CPUS_ON_NODE / SLURM_NTASKS * SLURM_NNODES ))".to_string(),
    };
    format!(
        "## OpenMP thread specification\n\
         threadcount={count}\n\
         if [ $threadcount -lt 1 ] ; then threadcount=1 ; fi\n\
         export OMP_NUM_THREADS=$threadcount\n\
         export OMP_PROC_BIND=true\n"
    )
}
