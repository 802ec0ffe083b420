//! C7 — Scene Store: persistent catalogue of layout descriptions (spec §4.7).
//! Mutation validates on `upsert`; switching the mixer's program scene does
//! not go through this store (the mixer only reads it), so editing a scene
//! that is not currently on program has no live effect. Backed by a single
//! JSON file written through on every mutation, loaded back at cold start —
//! the built-in scenes are re-seeded only when no catalogue file exists yet.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MixerInput {
    Camera { id: String },
    File { path: String, #[serde(rename = "loop")] looped: bool },
    Graphic { id: String },
    Guest { slot_id: String },
    TestPattern,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutSlot {
    pub input_ref: MixerInput,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub z_order: u32,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    #[serde(default = "default_audio_gain")]
    pub audio_gain: f64,
    #[serde(default = "default_true")]
    pub visible: bool,
}

fn default_opacity() -> f64 {
    1.0
}
fn default_audio_gain() -> f64 {
    1.0
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub scene_id: String,
    pub name: String,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub frame_rate: u32,
    #[serde(default = "default_background")]
    pub background_color: String,
    pub slots: Vec<LayoutSlot>,
}

fn default_background() -> String {
    "#000000".to_string()
}

pub struct SceneStore {
    scenes: RwLock<HashMap<String, Scene>>,
    known_camera_ids: Vec<String>,
    store_path: Option<PathBuf>,
}

impl SceneStore {
    /// Loads the catalogue from `store_path` if a file is already there;
    /// otherwise seeds the built-in scenes and writes them out as the initial
    /// catalogue. `store_path` of `None` keeps the store in-memory only, used
    /// by the `--test-mode` harness.
    pub fn load_or_seed_defaults(
        store_path: Option<PathBuf>,
        canvas_width: u32,
        canvas_height: u32,
        frame_rate: u32,
        camera_ids: &[String],
    ) -> Self {
        if let Some(path) = &store_path {
            match std::fs::read(path) {
                Ok(body) => match serde_json::from_slice::<HashMap<String, Scene>>(&body) {
                    Ok(scenes) => {
                        return Self {
                            scenes: RwLock::new(scenes),
                            known_camera_ids: camera_ids.to_vec(),
                            store_path,
                        };
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable scene catalogue"),
                },
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), error = %e, "failed to read scene catalogue");
                }
                Err(_) => {}
            }
        }
        let store = Self::with_defaults_at(store_path, canvas_width, canvas_height, frame_rate, camera_ids);
        store.save_to_disk();
        store
    }

    /// Seeds the built-in scenes required at cold start (spec §4.7): one
    /// fullscreen scene per camera, a 2x2 quad, a 2-up side-by-side, and a
    /// picture-in-picture scene using the first two cameras.
    pub fn with_defaults(canvas_width: u32, canvas_height: u32, frame_rate: u32, camera_ids: &[String]) -> Self {
        Self::with_defaults_at(None, canvas_width, canvas_height, frame_rate, camera_ids)
    }

    fn with_defaults_at(
        store_path: Option<PathBuf>,
        canvas_width: u32,
        canvas_height: u32,
        frame_rate: u32,
        camera_ids: &[String],
    ) -> Self {
        let store = Self {
            scenes: RwLock::new(HashMap::new()),
            known_camera_ids: camera_ids.to_vec(),
            store_path,
        };
        for (i, id) in camera_ids.iter().enumerate() {
            let scene = Scene {
                scene_id: format!("fullscreen_{id}"),
                name: format!("{id} fullscreen"),
                canvas_width,
                canvas_height,
                frame_rate,
                background_color: default_background(),
                slots: vec![LayoutSlot {
                    input_ref: MixerInput::Camera { id: id.clone() },
                    x: 0,
                    y: 0,
                    width: canvas_width,
                    height: canvas_height,
                    z_order: 0,
                    opacity: 1.0,
                    audio_gain: 1.0,
                    visible: true,
                }],
            };
            let _ = store.upsert_unchecked(scene);
            let _ = i;
        }

        if !camera_ids.is_empty() {
            let half_w = canvas_width / 2;
            let half_h = canvas_height / 2;
            let mut slots = Vec::new();
            for (i, id) in camera_ids.iter().take(4).enumerate() {
                let x = (i as u32 % 2) * half_w;
                let y = (i as u32 / 2) * half_h;
                slots.push(LayoutSlot {
                    input_ref: MixerInput::Camera { id: id.clone() },
                    x,
                    y,
                    width: half_w,
                    height: half_h,
                    z_order: i as u32,
                    opacity: 1.0,
                    audio_gain: 1.0,
                    visible: true,
                });
            }
            let _ = store.upsert_unchecked(Scene {
                scene_id: "quad".to_string(),
                name: "2x2 quad".to_string(),
                canvas_width,
                canvas_height,
                frame_rate,
                background_color: default_background(),
                slots,
            });
        }

        if camera_ids.len() >= 2 {
            let half_w = canvas_width / 2;
            let slots = vec![
                LayoutSlot {
                    input_ref: MixerInput::Camera { id: camera_ids[0].clone() },
                    x: 0,
                    y: 0,
                    width: half_w,
                    height: canvas_height,
                    z_order: 0,
                    opacity: 1.0,
                    audio_gain: 1.0,
                    visible: true,
                },
                LayoutSlot {
                    input_ref: MixerInput::Camera { id: camera_ids[1].clone() },
                    x: half_w,
                    y: 0,
                    width: half_w,
                    height: canvas_height,
                    z_order: 0,
                    opacity: 1.0,
                    audio_gain: 1.0,
                    visible: true,
                },
            ];
            let _ = store.upsert_unchecked(Scene {
                scene_id: "side_by_side".to_string(),
                name: "2-up side by side".to_string(),
                canvas_width,
                canvas_height,
                frame_rate,
                background_color: default_background(),
                slots,
            });

            let pip_w = canvas_width / 4;
            let pip_h = canvas_height / 4;
            let slots = vec![
                LayoutSlot {
                    input_ref: MixerInput::Camera { id: camera_ids[0].clone() },
                    x: 0,
                    y: 0,
                    width: canvas_width,
                    height: canvas_height,
                    z_order: 0,
                    opacity: 1.0,
                    audio_gain: 1.0,
                    visible: true,
                },
                LayoutSlot {
                    input_ref: MixerInput::Camera { id: camera_ids[1].clone() },
                    x: canvas_width - pip_w - 20,
                    y: canvas_height - pip_h - 20,
                    width: pip_w,
                    height: pip_h,
                    z_order: 1,
                    opacity: 1.0,
                    audio_gain: 0.0,
                    visible: true,
                },
            ];
            let _ = store.upsert_unchecked(Scene {
                scene_id: "pip".to_string(),
                name: "picture in picture".to_string(),
                canvas_width,
                canvas_height,
                frame_rate,
                background_color: default_background(),
                slots,
            });
        }

        store
    }

    pub fn get(&self, id: &str) -> Option<Scene> {
        self.scenes.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Scene> {
        self.scenes.read().values().cloned().collect()
    }

    pub fn delete(&self, id: &str) -> Result<(), CoreError> {
        let removed = self
            .scenes
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("scene {id}")));
        if removed.is_ok() {
            self.save_to_disk();
        }
        removed
    }

    pub fn upsert(&self, scene: Scene) -> Result<Scene, CoreError> {
        self.validate(&scene)?;
        self.upsert_unchecked(scene)
    }

    fn upsert_unchecked(&self, scene: Scene) -> Result<Scene, CoreError> {
        self.scenes.write().insert(scene.scene_id.clone(), scene.clone());
        self.save_to_disk();
        Ok(scene)
    }

    fn save_to_disk(&self) {
        let Some(path) = &self.store_path else { return };
        let snapshot = self.scenes.read().clone();
        let Ok(body) = serde_json::to_vec_pretty(&snapshot) else { return };
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "failed to create scene catalogue directory");
                return;
            }
        }
        if let Err(e) = std::fs::write(path, body) {
            warn!(path = %path.display(), error = %e, "failed to persist scene catalogue");
        }
    }

    fn validate(&self, scene: &Scene) -> Result<(), CoreError> {
        if scene.scene_id.trim().is_empty() {
            return Err(CoreError::ConfigInvalid("scene_id must not be empty".into()));
        }
        for slot in &scene.slots {
            if slot.x + slot.width > scene.canvas_width || slot.y + slot.height > scene.canvas_height {
                return Err(CoreError::ConfigInvalid(format!(
                    "slot for {:?} extends outside the {}x{} canvas",
                    slot.input_ref, scene.canvas_width, scene.canvas_height
                )));
            }
            self.resolve_input(&slot.input_ref)?;
        }

        let mut seen_z = std::collections::HashSet::new();
        for slot in scene.slots.iter().filter(|s| s.visible) {
            if !seen_z.insert(slot.z_order) {
                return Err(CoreError::ConfigInvalid(format!(
                    "duplicate z_order {} among visible slots",
                    slot.z_order
                )));
            }
        }
        Ok(())
    }

    fn resolve_input(&self, input: &MixerInput) -> Result<(), CoreError> {
        match input {
            MixerInput::Camera { id } => {
                if !self.known_camera_ids.contains(id) {
                    return Err(CoreError::ConfigInvalid(format!("unknown camera id {id} in scene input")));
                }
                Ok(())
            }
            MixerInput::File { path, .. } => {
                if path.trim().is_empty() {
                    return Err(CoreError::ConfigInvalid("file input path must not be empty".into()));
                }
                Ok(())
            }
            MixerInput::Graphic { id } => {
                if id.trim().is_empty() {
                    return Err(CoreError::ConfigInvalid("graphic input id must not be empty".into()));
                }
                Ok(())
            }
            MixerInput::Guest { slot_id } => {
                if slot_id.trim().is_empty() {
                    return Err(CoreError::ConfigInvalid("guest slot id must not be empty".into()));
                }
                Ok(())
            }
            MixerInput::TestPattern => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SceneStore {
        SceneStore::with_defaults(1920, 1080, 30, &["cam0".to_string(), "cam1".to_string()])
    }

    #[test]
    fn default_scenes_are_seeded_at_cold_start() {
        let store = store();
        let ids: Vec<_> = store.list().into_iter().map(|s| s.scene_id).collect();
        assert!(ids.contains(&"quad".to_string()));
        assert!(ids.contains(&"side_by_side".to_string()));
        assert!(ids.contains(&"pip".to_string()));
        assert!(ids.contains(&"fullscreen_cam0".to_string()));
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let store = store();
        let scene = Scene {
            scene_id: "custom".into(),
            name: "Custom".into(),
            canvas_width: 1920,
            canvas_height: 1080,
            frame_rate: 30,
            background_color: "#000000".into(),
            slots: vec![LayoutSlot {
                input_ref: MixerInput::Camera { id: "cam0".into() },
                x: 0,
                y: 0,
                width: 1920,
                height: 1080,
                z_order: 0,
                opacity: 1.0,
                audio_gain: 1.0,
                visible: true,
            }],
        };
        store.upsert(scene.clone()).unwrap();
        let fetched = store.get("custom").unwrap();
        assert_eq!(fetched.slots.len(), scene.slots.len());
        assert_eq!(fetched.name, scene.name);
    }

    #[test]
    fn upsert_rejects_slot_outside_canvas() {
        let store = store();
        let scene = Scene {
            scene_id: "bad".into(),
            name: "Bad".into(),
            canvas_width: 1920,
            canvas_height: 1080,
            frame_rate: 30,
            background_color: "#000000".into(),
            slots: vec![LayoutSlot {
                input_ref: MixerInput::Camera { id: "cam0".into() },
                x: 1800,
                y: 0,
                width: 500,
                height: 1080,
                z_order: 0,
                opacity: 1.0,
                audio_gain: 1.0,
                visible: true,
            }],
        };
        assert!(store.upsert(scene).is_err());
    }

    #[test]
    fn upsert_rejects_duplicate_z_order_among_visible_slots() {
        let store = store();
        let slot = |z| LayoutSlot {
            input_ref: MixerInput::Camera { id: "cam0".into() },
            x: 0,
            y: 0,
            width: 100,
            height: 100,
            z_order: z,
            opacity: 1.0,
            audio_gain: 1.0,
            visible: true,
        };
        let scene = Scene {
            scene_id: "dup_z".into(),
            name: "Dup".into(),
            canvas_width: 1920,
            canvas_height: 1080,
            frame_rate: 30,
            background_color: "#000000".into(),
            slots: vec![slot(0), slot(0)],
        };
        assert!(store.upsert(scene).is_err());
    }

    #[test]
    fn upsert_rejects_unknown_camera_id() {
        let store = store();
        let scene = Scene {
            scene_id: "unknown_cam".into(),
            name: "Unknown".into(),
            canvas_width: 1920,
            canvas_height: 1080,
            frame_rate: 30,
            background_color: "#000000".into(),
            slots: vec![LayoutSlot {
                input_ref: MixerInput::Camera { id: "cam9".into() },
                x: 0,
                y: 0,
                width: 100,
                height: 100,
                z_order: 0,
                opacity: 1.0,
                audio_gain: 1.0,
                visible: true,
            }],
        };
        assert!(store.upsert(scene).is_err());
    }

    #[test]
    fn delete_unknown_scene_is_not_found() {
        let store = store();
        assert!(matches!(store.delete("nope"), Err(CoreError::NotFound(_))));
    }
}
