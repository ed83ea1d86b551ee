//! Hand-maintained JSON schema documents for the persisted models.
//!
//! Emitted by the `dump-schemas` command for downstream tooling; kept in
//! sync with the serde models by the schema tests.

use serde_json::{json, Value};

/// Schema of the search configuration (`search.json`).
pub fn search_config_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "SearchConfig",
        "type": "object",
        "properties": {
            "project_dir": {"type": "string"},
            "stations": {
                "type": "object",
                "properties": {
                    "station_files": {"type": "array", "items": {"type": "string"}},
                    "stations": {"type": "array", "items": {"$ref": "#/$defs/station"}},
                    "blacklist": {"type": "array", "items": {"type": "string"}}
                }
            },
            "data_provider": {
                "type": "object",
                "required": ["provider"],
                "properties": {"provider": {"enum": ["synthetic"]}}
            },
            "octree": {
                "type": "object",
                "properties": {
                    "center_lat": {"type": "number"},
                    "center_lon": {"type": "number"},
                    "surface_elevation": {"type": "number"},
                    "root_size": {"type": "number", "exclusiveMinimum": 0},
                    "size_limit": {"type": "number", "exclusiveMinimum": 0},
                    "east_bounds": {"$ref": "#/$defs/bounds"},
                    "north_bounds": {"$ref": "#/$defs/bounds"},
                    "depth_bounds": {"$ref": "#/$defs/bounds"}
                }
            },
            "image_functions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["image", "phase"],
                    "properties": {
                        "image": {"enum": ["envelope", "sta-lta"]},
                        "phase": {"type": "string"},
                        "weight": {"type": "number"},
                        "blinding_seconds": {"type": "number"},
                        "channel_selector": {"type": "string"}
                    }
                }
            },
            "ray_tracers": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["tracer"],
                    "properties": {"tracer": {"enum": ["cake", "fast-marching"]}}
                }
            },
            "station_corrections": {"type": ["object", "null"]},
            "station_weights": {"type": ["object", "null"]},
            "magnitudes": {"type": "array"},
            "features": {"type": "array"},
            "sampling_rate": {"enum": [10.0, 20.0, 25.0, 50.0, 100.0]},
            "detection_threshold": {"type": "number", "exclusiveMinimum": 0},
            "node_split_threshold": {
                "type": "number",
                "exclusiveMinimum": 0,
                "exclusiveMaximum": 1
            },
            "detection_blinding_seconds": {"type": "number"},
            "image_mean_p": {"type": "number", "minimum": 1, "maximum": 2},
            "window_length_seconds": {"type": "number", "exclusiveMinimum": 0},
            "n_threads_parstack": {"type": "integer", "minimum": 0},
            "n_threads_argmax": {"type": "integer", "minimum": 1},
            "created": {"type": "string", "format": "date-time"}
        },
        "$defs": {
            "bounds": {
                "type": "array",
                "items": {"type": "number"},
                "minItems": 2,
                "maxItems": 2
            },
            "station": {
                "type": "object",
                "required": ["network", "station", "lat", "lon"],
                "properties": {
                    "network": {"type": "string", "maxLength": 2},
                    "station": {"type": "string", "maxLength": 5},
                    "location": {"type": "string", "maxLength": 3},
                    "lat": {"type": "number"},
                    "lon": {"type": "number"},
                    "east_shift": {"type": "number"},
                    "north_shift": {"type": "number"},
                    "elevation": {"type": "number"},
                    "depth": {"type": "number"}
                }
            }
        }
    })
}

/// Schema of the emitted detection records (`detections.jsonl`).
pub fn detections_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "EventDetection",
        "type": "object",
        "required": ["time", "lat", "lon", "semblance", "in_bounds", "n_stations"],
        "properties": {
            "time": {"type": "string", "format": "date-time"},
            "lat": {"type": "number"},
            "lon": {"type": "number"},
            "east_shift": {"type": "number"},
            "north_shift": {"type": "number"},
            "elevation": {"type": "number"},
            "depth": {"type": "number"},
            "semblance": {"type": "number"},
            "distance_border": {"type": "number"},
            "in_bounds": {"type": "boolean"},
            "n_stations": {"type": "integer", "minimum": 0},
            "uncertainty": {
                "type": ["object", "null"],
                "properties": {
                    "east": {"$ref": "#/$defs/range"},
                    "north": {"$ref": "#/$defs/range"},
                    "depth": {"$ref": "#/$defs/range"}
                }
            },
            "receivers": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "station": {"type": "object"},
                        "phase_arrivals": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "required": ["phase", "model"],
                                "properties": {
                                    "phase": {"type": "string"},
                                    "model": {
                                        "type": "object",
                                        "properties": {
                                            "phase": {"type": "string"},
                                            "time": {"type": "string", "format": "date-time"}
                                        }
                                    },
                                    "observed": {
                                        "type": ["string", "null"],
                                        "format": "date-time"
                                    }
                                }
                            }
                        }
                    }
                }
            },
            "magnitudes": {"type": "array"},
            "features": {"type": "array"}
        },
        "$defs": {
            "range": {
                "type": "array",
                "items": {"type": "number"},
                "minItems": 2,
                "maxItems": 2
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchConfig;

    #[test]
    fn test_default_config_matches_schema_properties() {
        let schema = search_config_schema();
        let properties = schema["properties"].as_object().unwrap();

        let config = serde_json::to_value(SearchConfig::default()).unwrap();
        for key in config.as_object().unwrap().keys() {
            assert!(
                properties.contains_key(key),
                "config field {key} missing from schema"
            );
        }
    }

    #[test]
    fn test_sampling_rates_in_sync() {
        let schema = search_config_schema();
        let rates = schema["properties"]["sampling_rate"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(rates.len(), 5);
    }
}
