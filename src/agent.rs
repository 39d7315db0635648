use serde::{Deserialize, Serialize};

/// A simulated town resident, immutable for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub traits: String,
    pub daily_goal: String,
    /// Plan memory written for this character when the world is reset
    #[serde(default)]
    pub seed_plan: Option<String>,
}

impl Character {
    pub fn new(id: &str, name: &str, traits: &str, daily_goal: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            traits: traits.to_string(),
            daily_goal: daily_goal.to_string(),
            seed_plan: None,
        }
    }

    pub fn with_seed_plan(mut self, plan: &str) -> Self {
        self.seed_plan = Some(plan.to_string());
        self
    }

    /// Seed plan content, falling back to the daily goal
    pub fn seed_plan_text(&self) -> String {
        match &self.seed_plan {
            Some(plan) => plan.clone(),
            None => format!("Today I want to {}", self.daily_goal),
        }
    }
}

/// Built-in town roster, in scheduler iteration order
pub fn default_roster() -> Vec<Character> {
    vec![
        Character::new(
            "mara",
            "Mara",
            "warm, early riser, gossips while she kneads dough",
            "sell out of sourdough before noon and hear the latest news",
        )
        .with_seed_plan("Bake at dawn, open the stall at the market, close up by the cafe."),
        Character::new(
            "bram",
            "Bram",
            "restless street musician, dramatic, easily distracted",
            "draw a crowd big enough to earn a slot on the stage tonight",
        )
        .with_seed_plan("Busk in the plaza all afternoon, rehearse in the park, play the stage at night."),
        Character::new(
            "iris",
            "Iris",
            "quiet librarian, observant, keeps meticulous notes",
            "finish cataloguing the donated books and find out who left them",
        )
        .with_seed_plan("Open the library, sort the donations, ask around the plaza about the donor."),
    ]
}

/// Find a character by id
pub fn find<'a>(roster: &'a [Character], agent_id: &str) -> Option<&'a Character> {
    roster.iter().find(|c| c.id == agent_id)
}
