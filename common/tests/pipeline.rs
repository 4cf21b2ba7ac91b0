//! Escenarios de punta a punta en un solo proceso: cola en memoria, store
//! en memoria y TIFFs reales en un directorio temporal.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::background::SilhouetteBackground;
use common::completion::{self, RunState, StatusLookup};
use common::config::{PipelineSettings, TrackSettings};
use common::executor::{Executor, IdleSummary};
use common::image::{self, GrayImage, SampleType};
use common::keys;
use common::mask::LabelMask;
use common::model_cache::ModelCache;
use common::naming::NamingConvention;
use common::orchestrator::Orchestrator;
use common::queue::MemoryQueue;
use common::registry::{StageContext, StageRegistry};
use common::run::ProcessRequest;
use common::segmenter::BuiltinLoader;
use common::store::{MemoryStore, SharedStore};
use common::task::{StageCall, StageKind, TaskEnvelope, TrackParams};

struct Cluster {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    orch: Orchestrator,
    exec: Executor,
    dir: tempfile::TempDir,
}

fn cluster() -> Cluster {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let naming = NamingConvention::default();
    let ctx = StageContext {
        store: store.clone(),
        dispatcher: queue.clone(),
        models: Arc::new(ModelCache::new(Arc::new(BuiltinLoader))),
        background: Arc::new(SilhouetteBackground),
        naming: naming.clone(),
    };
    Cluster {
        orch: Orchestrator::new(store.clone(), queue.clone(), naming, keys::DEFAULT_PENDING_TTL),
        exec: Executor::new(Arc::new(StageRegistry::standard()), ctx),
        store,
        queue,
        dir: tempfile::tempdir().unwrap(),
    }
}

/// Imagen 16x16 con fondo 100 y un cuadrado brillante en (y0, x0).
fn write_blob(dir: &Path, name: &str, y0: usize, x0: usize) -> PathBuf {
    let (h, w) = (16, 16);
    let mut data = vec![100.0f32; h * w];
    for y in y0..y0 + 5 {
        for x in x0..x0 + 5 {
            data[y * w + x] = 1000.0;
        }
    }
    let path = dir.join("raw").join(name);
    image::write_image(&path, &GrayImage::new(h, w, SampleType::U16, data).unwrap()).unwrap();
    path
}

fn request(paths: Vec<PathBuf>, total_fovs: Option<u32>) -> ProcessRequest {
    ProcessRequest {
        img_paths: paths,
        run_id: "run1".into(),
        dst_folder: "masks".into(),
        round: None,
        total_fovs,
        settings: PipelineSettings::default(),
    }
}

fn tracks(summary: &IdleSummary) -> usize {
    summary
        .reports
        .iter()
        .filter(|r| r.stage == StageKind::Track)
        .count()
}

#[tokio::test]
async fn single_round_one_image_waits_for_sibling() {
    let c = cluster();
    let img = write_blob(c.dir.path(), "A1_P1_refseg_1.tif", 4, 4);

    let resp = c.orch.submit_batch(&request(vec![img], None)).await.unwrap();
    assert_eq!(resp.submitted.len(), 1);

    let summary = c.exec.run_until_idle(&c.queue).await.unwrap();
    assert!(summary.failures.is_empty(), "{:?}", summary.failures);
    assert_eq!(tracks(&summary), 0);

    assert_eq!(c.store.hlen("masks:run1:A1_P1").await.unwrap(), 1);
    assert!(c.dir.path().join("masks").join("A1_P1_mask_1.tif").is_file());
    assert_eq!(c.orch.run_status("run1").await, StatusLookup::NotFound);
}

#[tokio::test]
async fn both_rounds_track_once_and_finish_the_run() {
    let c = cluster();
    let r1 = write_blob(c.dir.path(), "A1_P1_refseg_1.tif", 4, 4);
    let r2 = write_blob(c.dir.path(), "A1_P1_refseg_2.tif", 4, 4);

    c.orch.submit_batch(&request(vec![r1], None)).await.unwrap();
    let first = c.exec.run_until_idle(&c.queue).await.unwrap();
    assert_eq!(tracks(&first), 0);

    c.orch.submit_batch(&request(vec![r2], Some(1))).await.unwrap();
    let StatusLookup::Found(status) = c.orch.run_status("run1").await else {
        panic!("el run debería estar en curso");
    };
    assert_eq!((status.status, status.remaining), (RunState::Processing, 1));

    let second = c.exec.run_until_idle(&c.queue).await.unwrap();
    assert!(second.failures.is_empty(), "{:?}", second.failures);
    assert_eq!(tracks(&second), 1);

    let masks = c.dir.path().join("masks");
    let track_report = second
        .reports
        .iter()
        .find(|r| r.stage == StageKind::Track)
        .unwrap();
    assert!(track_report
        .summary
        .contains(&masks.join("A1_P1_mask_1.tif").display().to_string()));

    assert!(!c.store.exists("masks:run1:A1_P1").await.unwrap());
    let StatusLookup::Found(status) = c.orch.run_status("run1").await else {
        panic!("el run debería estar terminado");
    };
    assert_eq!(status.status, RunState::Finished);

    // el objeto se superpone en ambos tiempos: mismo label en las dos máscaras
    let m1 = image::read_label_image(&masks.join("A1_P1_mask_1.tif")).unwrap();
    let m2 = image::read_label_image(&masks.join("A1_P1_mask_2.tif")).unwrap();
    assert_eq!(m1.max_label(), 1);
    assert_eq!(m2.max_label(), 1);
}

#[tokio::test]
async fn round_two_before_round_one_still_pairs() {
    let c = cluster();
    let r1 = write_blob(c.dir.path(), "B2_refseg_1.tif", 2, 2);
    let r2 = write_blob(c.dir.path(), "B2_refseg_2.tif", 2, 2);

    c.orch.submit_batch(&request(vec![r2], Some(1))).await.unwrap();
    c.exec.run_until_idle(&c.queue).await.unwrap();
    c.orch.submit_batch(&request(vec![r1], Some(1))).await.unwrap();
    let summary = c.exec.run_until_idle(&c.queue).await.unwrap();

    assert_eq!(tracks(&summary), 1);
    assert!(c.store.exists(&keys::finished_key("run1")).await.unwrap());
}

#[tokio::test]
async fn three_frame_stack_trims_to_nothing() {
    let c = cluster();
    let frames = [
        vec![vec![0, 1], vec![0, 1]],
        vec![vec![0, 1], vec![0, 1]],
        vec![vec![1, 0], vec![1, 0]],
    ];
    let paths: Vec<PathBuf> = frames
        .iter()
        .enumerate()
        .map(|(t, rows)| {
            let p = c.dir.path().join(format!("C3_mask_{}.tif", t + 1));
            image::write_labeled_image(&p, &LabelMask::from_rows(rows).unwrap()).unwrap();
            p
        })
        .collect();

    let env = TaskEnvelope::new(StageCall::Track(TrackParams {
        mask_paths: paths.clone(),
        track: TrackSettings {
            stitch_threshold: 0.25,
            relabel_sequential: false,
        },
    }));
    c.queue.push(env).unwrap();
    let summary = c.exec.run_until_idle(&c.queue).await.unwrap();
    assert!(summary.failures.is_empty(), "{:?}", summary.failures);

    for p in &paths {
        assert_eq!(image::read_label_image(p).unwrap().max_label(), 0, "{}", p.display());
    }
}

#[tokio::test]
async fn finalize_twice_leaves_same_state() {
    let c = cluster();
    let store: &dyn SharedStore = &*c.store;
    completion::init_pending(store, "run1", 1, keys::DEFAULT_PENDING_TTL)
        .await
        .unwrap();

    completion::finalize_run(store, "run1").await.unwrap();
    let after_first = (
        store.exists("finished:run1").await.unwrap(),
        store.exists("pending_tracks:run1").await.unwrap(),
    );
    completion::finalize_run(store, "run1").await.unwrap();
    let after_second = (
        store.exists("finished:run1").await.unwrap(),
        store.exists("pending_tracks:run1").await.unwrap(),
    );

    assert_eq!(after_first, (true, false));
    assert_eq!(after_first, after_second);
}
