//! Game adapters: bounded post-processing over tracked detections,
//! selected by the client's game id. Unknown ids pass through untouched.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use zelty_config_data::GameConfig;
use zelty_types::GameState;

/// Class id used for head boxes by the supported shooter models.
pub const HEAD_CLASS_ID: u8 = 2;

/// Map a `[games.<name>]` config key to its wire game id.
pub fn game_id_for_name(name: &str) -> Option<u8> {
    match name {
        "cs16" => Some(1),
        "csgo" => Some(2),
        "valorant" => Some(3),
        "apex" => Some(4),
        "pubg" => Some(5),
        "fortnite" => Some(6),
        "cs2" => Some(7),
        "l4d2" => Some(8),
        _ => None,
    }
}

pub trait GameAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn process(&self, state: &mut GameState);
}

/// Adapter for the classic-shooter detection models: shifts head-class
/// boxes by the configured vertical offset and rescales their extents.
pub struct ClassicShooterAdapter {
    name: String,
    config: GameConfig,
}

impl ClassicShooterAdapter {
    pub fn new(name: String, config: GameConfig) -> Self {
        Self { name, config }
    }
}

impl GameAdapter for ClassicShooterAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, state: &mut GameState) {
        for det in &mut state.detections {
            if det.class_id != HEAD_CLASS_ID {
                continue;
            }
            let mut bbox = det.bbox;
            bbox.y += self.config.aim_target_offset_y;
            bbox.width *= self.config.head_size_factor;
            bbox.height *= self.config.head_size_factor;
            det.bbox = bbox.clamp_unit();
        }
    }
}

/// Registry keyed by game id, built once at startup from the server
/// config.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<u8, Box<dyn GameAdapter>>,
}

impl AdapterRegistry {
    pub fn from_config(games: &BTreeMap<String, GameConfig>) -> Self {
        let mut adapters: BTreeMap<u8, Box<dyn GameAdapter>> = BTreeMap::new();
        for (name, game_config) in games {
            if !game_config.enabled {
                continue;
            }
            match game_id_for_name(name) {
                Some(id) => {
                    debug!("game adapter \"{name}\" active for game id {id}");
                    adapters.insert(
                        id,
                        Box::new(ClassicShooterAdapter::new(name.clone(), game_config.clone())),
                    );
                }
                None => warn!("unknown game \"{name}\" in config; ignoring"),
            }
        }
        Self { adapters }
    }

    pub fn process(&self, game_id: u8, state: &mut GameState) {
        if let Some(adapter) = self.adapters.get(&game_id) {
            adapter.process(state);
        }
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
