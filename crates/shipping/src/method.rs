use serde::{Deserialize, Serialize};

use fulfillment_core::{Entity, ShippingMethodId};

use crate::scope::Audience;

/// Where a shipping method may be offered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayOn {
    #[default]
    Both,
    FrontEnd,
    BackEnd,
}

impl DisplayOn {
    pub fn visible_to(self, audience: Audience) -> bool {
        matches!(
            (self, audience),
            (DisplayOn::Both, _)
                | (DisplayOn::FrontEnd, Audience::Frontend)
                | (DisplayOn::BackEnd, Audience::Backend)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DisplayOn::Both => "both",
            DisplayOn::FrontEnd => "front_end",
            DisplayOn::BackEnd => "back_end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "both" => Some(DisplayOn::Both),
            "front_end" => Some(DisplayOn::FrontEnd),
            "back_end" => Some(DisplayOn::BackEnd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingMethod {
    pub id: ShippingMethodId,
    pub name: String,
    pub display_on: DisplayOn,
}

impl Entity for ShippingMethod {
    type Id = ShippingMethodId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_is_visible_everywhere_and_sides_are_exclusive() {
        for audience in [Audience::Frontend, Audience::Backend] {
            assert!(DisplayOn::Both.visible_to(audience));
        }
        assert!(DisplayOn::FrontEnd.visible_to(Audience::Frontend));
        assert!(!DisplayOn::FrontEnd.visible_to(Audience::Backend));
        assert!(DisplayOn::BackEnd.visible_to(Audience::Backend));
        assert!(!DisplayOn::BackEnd.visible_to(Audience::Frontend));
    }
}
