use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const MAX_DEVICE_ID: u16 = 1000;
pub const INITIAL_TEMP: i64 = 25;
pub const INITIAL_BAT: i64 = 50;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
pub struct Reading {
    pub id: u16,
    pub temp: i64, // C
    pub bat: i64, // %
}

/// A fake sensor node whose temperature and battery level wander by at most
/// one unit per step.
#[derive(Debug, Clone)]
pub struct Device {
    id: u16,
    temp: i64,
    bat: i64,
}
impl Device {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            temp: INITIAL_TEMP,
            bat: INITIAL_BAT,
        }
    }
    pub fn random(rng: &mut impl Rng) -> Self {
        Self::new(rng.gen_range(0..=MAX_DEVICE_ID))
    }

    pub fn id(&self) -> u16 {
        self.id
    }
    pub fn reading(&self) -> Reading {
        Reading {
            id: self.id,
            temp: self.temp,
            bat: self.bat,
        }
    }
    pub fn drift(&mut self, rng: &mut impl Rng) {
        self.temp += rng.gen_range(-1..=1);
        self.bat += rng.gen_range(-1..=1);
    }
}

/// Wire format is a one-element JSON array, e.g. `[{"id":417,"temp":25,"bat":50}]`.
pub fn payload(reading: &Reading) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&[reading])?)
}
