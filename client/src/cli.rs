use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::completion::RunStatus;
use common::config::{env_or, BackgroundSettings, PipelineSettings, TrackSettings};
use common::run::{
    BackgroundRequest, BackgroundResponse, CleanupResponse, ErrorResponse, ProcessRequest,
    ProcessResponse, RegisterMasksRequest, RegisterMasksResponse,
};
use common::WorkerMetrics;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::path::PathBuf;

/// Igual que en el worker:
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env_or("MASTER_URL", "http://localhost:8080".to_string())
}

#[derive(Debug, Parser)]
#[command(name = "client")]
#[command(about = "CLI para enviar imágenes al pipeline y consultar runs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Encola bg-sub -> segmentación -> pairing para imágenes o directorios
    Process {
        #[arg(value_name = "IMAGEN_O_DIR", required = true)]
        paths: Vec<PathBuf>,

        #[arg(long)]
        run_id: String,

        /// Carpeta donde se escriben las máscaras
        #[arg(long)]
        dst_folder: PathBuf,

        /// Ronda; si falta se deduce del nombre
        #[arg(long)]
        round: Option<u32>,

        /// Cantidad de FOVs del run (obligatorio en ronda 2)
        #[arg(long)]
        total_fovs: Option<u32>,

        /// JSON con los settings del pipeline
        #[arg(long, value_name = "SETTINGS_JSON")]
        settings: Option<PathBuf>,
    },

    /// Sólo resta el fondo (sin segmentar)
    Background {
        #[arg(value_name = "IMAGEN_O_DIR", required = true)]
        paths: Vec<PathBuf>,

        #[arg(long, default_value_t = 0.0)]
        sigma: f32,

        #[arg(long, default_value_t = 7)]
        size: usize,
    },

    /// Registra máscaras ya existentes y dispara el tracking
    RegisterMasks {
        #[arg(value_name = "MASCARA", required = true)]
        paths: Vec<PathBuf>,

        #[arg(long)]
        run_id: String,

        #[arg(long)]
        total_fovs: u32,

        #[arg(long, default_value_t = 0.75)]
        stitch_threshold: f64,

        /// Compacta los labels a 1..k tras recortar
        #[arg(long)]
        relabel: bool,
    },

    /// Consulta el estado de un run
    Status {
        #[arg(value_name = "RUN_ID")]
        run_id: String,
    },

    /// Borra las claves de runs cuyo id empieza con el prefijo
    Cleanup {
        #[arg(long, default_value = "")]
        prefix: String,
    },

    Workers,
}

/// Arma el request de `process`; lee y valida los settings localmente.
pub fn process_request(
    paths: Vec<PathBuf>,
    run_id: String,
    dst_folder: PathBuf,
    round: Option<u32>,
    total_fovs: Option<u32>,
    settings: Option<PathBuf>,
) -> Result<ProcessRequest> {
    let settings = match settings {
        Some(path) => PipelineSettings::from_file(&path)
            .with_context(|| format!("settings inválidos en {}", path.display()))?,
        None => PipelineSettings::default(),
    };
    Ok(ProcessRequest {
        img_paths: paths,
        run_id,
        dst_folder,
        round,
        total_fovs,
        settings,
    })
}

/// Decodifica la respuesta o convierte el `ErrorResponse` del master en error.
async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let detail = resp
        .json::<ErrorResponse>()
        .await
        .map(|e| e.error)
        .unwrap_or_default();
    bail!("el master respondió {status}: {detail}")
}

fn print_rejected(rejected: &[common::run::RejectedPath]) {
    for r in rejected {
        println!("  rechazada: {} ({})", r.path.display(), r.reason);
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Process {
            paths,
            run_id,
            dst_folder,
            round,
            total_fovs,
            settings,
        } => {
            let req = process_request(paths, run_id, dst_folder, round, total_fovs, settings)?;
            let url = format!("{}/api/v1/runs/process", base_url);
            let resp: ProcessResponse = read_json(client.post(&url).json(&req).send().await?).await?;

            println!("Run {}:", resp.run_id);
            for s in &resp.submitted {
                println!(
                    "  encolada: {} (ronda {}, tarea {})",
                    s.img_path.display(),
                    s.round,
                    s.task_id
                );
            }
            print_rejected(&resp.rejected);
        }

        Commands::Background { paths, sigma, size } => {
            let req = BackgroundRequest {
                img_paths: paths,
                background: BackgroundSettings { sigma, size },
            };
            let url = format!("{}/api/v1/runs/background", base_url);
            let resp: BackgroundResponse =
                read_json(client.post(&url).json(&req).send().await?).await?;

            println!("{} tareas de bg-sub encoladas", resp.task_ids.len());
            print_rejected(&resp.rejected);
        }

        Commands::RegisterMasks {
            paths,
            run_id,
            total_fovs,
            stitch_threshold,
            relabel,
        } => {
            let track = TrackSettings {
                stitch_threshold,
                relabel_sequential: relabel,
            };
            track.validate()?;
            let req = RegisterMasksRequest {
                run_id,
                mask_paths: paths,
                total_fovs,
                track,
            };
            let url = format!("{}/api/v1/masks/register", base_url);
            let resp: RegisterMasksResponse =
                read_json(client.post(&url).json(&req).send().await?).await?;

            println!("Máscaras registradas: {}", resp.registered);
            println!("Trackings despachados: {}", resp.tracking_task_ids.len());
            print_rejected(&resp.rejected);
        }

        Commands::Status { run_id } => {
            let url = format!("{}/api/v1/runs/{}/status", base_url, run_id);
            let resp = client.get(&url).send().await?;
            if resp.status() == StatusCode::NOT_FOUND {
                println!("Run {run_id}: no encontrado (nunca existió o ya se limpió)");
                return Ok(());
            }
            let status: RunStatus = read_json(resp).await?;
            println!("Run {}:", status.run_id);
            println!("  estado    : {:?}", status.status);
            println!("  pendientes: {}", status.remaining);
        }

        Commands::Cleanup { prefix } => {
            let url = format!("{}/api/v1/runs/stale", base_url);
            let resp = client
                .delete(&url)
                .query(&[("prefix", prefix.as_str())])
                .send()
                .await?;
            let resp: CleanupResponse = read_json(resp).await?;
            println!(
                "{} claves borradas con prefijo '{}'",
                resp.deleted, resp.prefix
            );
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let workers: Vec<WorkerMetrics> = read_json(client.get(&url).send().await?).await?;
            if workers.is_empty() {
                println!("No hay workers registrados.");
            }
            for w in workers {
                println!("Worker {}", w.worker_id);
                println!("  host           : {}", w.hostname);
                println!("  dead           : {}", w.dead);
                println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                println!(
                    "  concurrency    : {}/{} en vuelo",
                    w.active_tasks, w.max_concurrency
                );
                println!(
                    "  tareas         : started={}, ok={}, failed={}",
                    w.tasks_started, w.tasks_succeeded, w.tasks_failed
                );
                match w.avg_task_ms {
                    Some(avg) => println!("  avg_task_ms    : {:.1}", avg),
                    None => println!("  avg_task_ms    : (sin datos)"),
                }
                match w.last_cpu_percent {
                    Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
                    None => println!("  cpu_percent    : (sin datos)"),
                }
                match w.last_mem_bytes {
                    Some(mem) => println!("  mem_bytes      : {}", mem),
                    None => println!("  mem_bytes      : (sin datos)"),
                }
                println!();
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn process_accepts_several_paths() {
        let cli = Cli::try_parse_from([
            "client",
            "process",
            "/data/raw/A1_refseg_1.tif",
            "/data/raw/A1_refseg_2.tif",
            "--run-id",
            "r1",
            "--dst-folder",
            "/data/masks",
            "--total-fovs",
            "4",
        ])
        .unwrap();

        match cli.command {
            Commands::Process {
                paths,
                total_fovs,
                round,
                ..
            } => {
                assert_eq!(paths.len(), 2);
                assert_eq!(total_fovs, Some(4));
                assert_eq!(round, None);
            }
            other => panic!("comando inesperado: {other:?}"),
        }
    }

    #[test]
    fn register_masks_requires_total_fovs() {
        let res = Cli::try_parse_from([
            "client",
            "register-masks",
            "/m/A1_mask_1.tif",
            "--run-id",
            "r1",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn settings_file_is_loaded_and_validated() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"track": {{"stitch_threshold": 0.5}}}}"#).unwrap();

        let req = process_request(
            vec!["/d/A1_refseg_1.tif".into()],
            "r1".into(),
            "/d/masks".into(),
            None,
            None,
            Some(file.path().to_path_buf()),
        )
        .unwrap();
        assert_eq!(req.settings.track.stitch_threshold, 0.5);
        assert_eq!(req.settings.eval, Default::default());
    }

    #[test]
    fn settings_with_typos_are_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"track": {{"stich_threshold": 0.5}}}}"#).unwrap();

        let res = process_request(
            vec![],
            "r1".into(),
            "/d/masks".into(),
            None,
            None,
            Some(file.path().to_path_buf()),
        );
        assert!(res.is_err());
    }
}
