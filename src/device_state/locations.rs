//! Built-in site catalog
//!
//! Deployment sites the change_location command can select between.

use super::types::Location;

const CATALOG: &[(&str, &str, f64, f64)] = &[
    ("charlottenburg", "Charlottenburg Rooftop", 52.5050, 13.3117),
    ("grunewald", "Grunewald Field Station", 52.4872, 13.2614),
    ("prenzlauer_berg", "Prenzlauer Berg Garden", 52.5324, 13.4125),
    ("mitte_gendarmenmarkt", "Mitte Gendarmenmarkt", 52.5139, 13.3925),
    ("zehlendorf", "Zehlendorf Greenhouse", 52.4491, 13.2594),
];

/// All selectable sites
pub fn catalog() -> Vec<Location> {
    CATALOG
        .iter()
        .map(|(id, name, lat, lon)| Location {
            id: (*id).to_string(),
            name: (*name).to_string(),
            lat: *lat,
            lon: *lon,
        })
        .collect()
}

/// Resolve a site by id
pub fn find(id: &str) -> Option<Location> {
    CATALOG
        .iter()
        .find(|(catalog_id, ..)| *catalog_id == id)
        .map(|(id, name, lat, lon)| Location {
            id: (*id).to_string(),
            name: (*name).to_string(),
            lat: *lat,
            lon: *lon,
        })
}
