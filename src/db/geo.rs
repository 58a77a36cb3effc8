//! Geo members live in a sorted set; the score is a 52-bit interleave of the
//! normalised longitude and latitude.

use bytes::Bytes;

use super::{Db, StoreError};

pub const MIN_LATITUDE: f64 = -85.05112878;
pub const MAX_LATITUDE: f64 = 85.05112878;
pub const MIN_LONGITUDE: f64 = -180.0;
pub const MAX_LONGITUDE: f64 = 180.0;

const LATITUDE_RANGE: f64 = MAX_LATITUDE - MIN_LATITUDE;
const LONGITUDE_RANGE: f64 = MAX_LONGITUDE - MIN_LONGITUDE;
const STEPS: f64 = (1u64 << 26) as f64;

pub fn is_valid(longitude: f64, latitude: f64) -> bool {
    (MIN_LONGITUDE..=MAX_LONGITUDE).contains(&longitude)
        && (MIN_LATITUDE..=MAX_LATITUDE).contains(&latitude)
}

fn spread(v: u32) -> u64 {
    let mut v = v as u64;
    v = (v | (v << 16)) & 0x0000_FFFF_0000_FFFF;
    v = (v | (v << 8)) & 0x00FF_00FF_00FF_00FF;
    v = (v | (v << 4)) & 0x0F0F_0F0F_0F0F_0F0F;
    v = (v | (v << 2)) & 0x3333_3333_3333_3333;
    (v | (v << 1)) & 0x5555_5555_5555_5555
}

fn compact(v: u64) -> u32 {
    let mut v = v & 0x5555_5555_5555_5555;
    v = (v | (v >> 1)) & 0x3333_3333_3333_3333;
    v = (v | (v >> 2)) & 0x0F0F_0F0F_0F0F_0F0F;
    v = (v | (v >> 4)) & 0x00FF_00FF_00FF_00FF;
    v = (v | (v >> 8)) & 0x0000_FFFF_0000_FFFF;
    ((v | (v >> 16)) & 0x0000_0000_FFFF_FFFF) as u32
}

pub fn encode(longitude: f64, latitude: f64) -> u64 {
    let lon = (STEPS * (longitude - MIN_LONGITUDE) / LONGITUDE_RANGE) as u32;
    let lat = (STEPS * (latitude - MIN_LATITUDE) / LATITUDE_RANGE) as u32;

    (spread(lon) << 1) | spread(lat)
}

/// Centre of the cell the score names, as `(longitude, latitude)`.
pub fn decode(score: u64) -> (f64, f64) {
    let lon = compact(score >> 1) as f64 + 0.5;
    let lat = compact(score) as f64 + 0.5;

    (
        lon / STEPS * LONGITUDE_RANGE + MIN_LONGITUDE,
        lat / STEPS * LATITUDE_RANGE + MIN_LATITUDE,
    )
}

impl Db {
    /// Coordinates must already be validated. Returns how many members were new.
    pub fn geoadd(&self, key: &str, places: Vec<(f64, f64, Bytes)>) -> Result<usize, StoreError> {
        let members = places
            .into_iter()
            .map(|(longitude, latitude, name)| (encode(longitude, latitude) as f64, name))
            .collect();

        self.zadd(key, members)
    }

    pub fn geopos(&self, key: &str, names: &[Bytes]) -> Result<Vec<Option<(f64, f64)>>, StoreError> {
        names
            .iter()
            .map(|name| Ok(self.zscore(key, name)?.map(|score| decode(score as u64))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_stays_close() {
        let (lon, lat) = (13.361389, 38.115556);
        let (dlon, dlat) = decode(encode(lon, lat));

        assert!((dlon - lon).abs() < 1e-4);
        assert!((dlat - lat).abs() < 1e-4);
    }

    #[test]
    fn score_fits_52_bits() {
        assert!(encode(MAX_LONGITUDE - 1e-9, MAX_LATITUDE - 1e-9) < 1 << 52);
    }

    #[test]
    fn validation() {
        assert!(is_valid(0.0, 0.0));
        assert!(!is_valid(181.0, 0.0));
        assert!(!is_valid(0.0, 85.1));
    }

    #[test]
    fn geopos_of_missing_member() {
        let db = Db::new();
        db.geoadd("g", vec![(2.0, 48.0, Bytes::from("paris"))]).unwrap();

        let positions = db.geopos("g", &[Bytes::from("paris"), Bytes::from("nowhere")]).unwrap();
        assert!(positions[0].is_some());
        assert_eq!(positions[1], None);
    }
}
