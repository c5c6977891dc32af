use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Terrain height lookup. Implemented by the host's world.
pub trait GroundSampler: Send + Sync {
    fn ground_y(&self, pos: Vec3) -> f32;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlatGround {
    pub height: f32,
}

impl GroundSampler for FlatGround {
    fn ground_y(&self, _pos: Vec3) -> f32 {
        self.height
    }
}

/// How the vertical axis of a networked position is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElevationPolicyMode {
    /// Keep the y carried by the network.
    #[default]
    PreserveNetwork,
    /// Replace y with the sampled terrain height unless the actor has vertical intent.
    GroundSnap,
}

/// Client-side blend between the predicted and authoritative ground samples.
const CLIENT_GROUND_BLEND: f32 = 0.65;

impl ElevationPolicyMode {
    pub fn resolve_server(
        self,
        integrated: Vec3,
        ground: Option<&dyn GroundSampler>,
        has_vertical_intent: bool,
    ) -> Vec3 {
        match (self, ground) {
            (Self::GroundSnap, Some(ground)) if !has_vertical_intent => {
                Vec3::new(integrated.x, ground.ground_y(integrated), integrated.z)
            }
            _ => integrated,
        }
    }

    pub fn resolve_client(
        self,
        authoritative: Vec3,
        predicted: Vec3,
        ground: Option<&dyn GroundSampler>,
        has_vertical_intent: bool,
    ) -> Vec3 {
        match (self, ground) {
            (Self::GroundSnap, Some(ground)) if !has_vertical_intent => {
                let predicted_y = ground.ground_y(predicted);
                let authoritative_y = ground.ground_y(authoritative);
                let y = predicted_y + (authoritative_y - predicted_y) * CLIENT_GROUND_BLEND;
                Vec3::new(authoritative.x, y, authoritative.z)
            }
            _ => authoritative,
        }
    }
}
