//! Index mapping, template, and lifecycle policy bodies.

use serde_json::{json, Value};

/// Mapping and settings applied to every event index.
pub fn events_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "@timestamp": {"type": "date"},
                "received_at": {"type": "date"},
                "event_id": {"type": "keyword"},
                "project_id": {"type": "integer"},
                "level": {"type": "keyword"},
                "platform": {"type": "keyword"},
                "environment": {"type": "keyword"},
                "release": {"type": "keyword"},
                "transaction": {"type": "keyword"},
                "server_name": {"type": "keyword"},
                "logger": {"type": "keyword"},
                "message": {
                    "type": "text",
                    "analyzer": "standard",
                    "fields": {"keyword": {"type": "keyword", "ignore_above": 256}}
                },
                "exception_type": {"type": "keyword"},
                "exception_value": {
                    "type": "text",
                    "fields": {"keyword": {"type": "keyword", "ignore_above": 256}}
                },
                "stacktrace": {"type": "text"},
                "user": {
                    "properties": {
                        "id": {"type": "keyword"},
                        "email_hash": {"type": "keyword"},
                        "username": {"type": "keyword"},
                        "ip": {"type": "ip"}
                    }
                },
                "geo": {
                    "properties": {
                        "country_code": {"type": "keyword"},
                        "country_name": {"type": "keyword"},
                        "region_name": {"type": "keyword"},
                        "city": {"type": "keyword"},
                        "location": {"type": "geo_point"}
                    }
                },
                "browser": {
                    "properties": {
                        "name": {"type": "keyword"},
                        "version": {"type": "keyword"}
                    }
                },
                "os": {
                    "properties": {
                        "name": {"type": "keyword"},
                        "version": {"type": "keyword"}
                    }
                },
                "device": {
                    "properties": {
                        "family": {"type": "keyword"},
                        "model": {"type": "keyword"},
                        "brand": {"type": "keyword"}
                    }
                },
                "runtime": {
                    "properties": {
                        "name": {"type": "keyword"},
                        "version": {"type": "keyword"}
                    }
                },
                "request": {
                    "properties": {
                        "url": {"type": "keyword"},
                        "method": {"type": "keyword"}
                    }
                },
                "tags": {"type": "object", "dynamic": true},
                "sdk": {
                    "properties": {
                        "name": {"type": "keyword"},
                        "version": {"type": "keyword"}
                    }
                },
                "fingerprint": {"type": "keyword"}
            }
        },
        "settings": {
            "number_of_shards": 3,
            "number_of_replicas": 1,
            "refresh_interval": "5s",
            "index.mapping.total_fields.limit": 2000
        }
    })
}

/// Composable index template for `{prefix}-*`.
pub fn index_template(prefix: &str) -> Value {
    json!({
        "index_patterns": [format!("{prefix}-*")],
        "template": events_mapping(),
        "priority": 100,
        "_meta": {
            "description": "Template for event indices"
        }
    })
}

/// Index State Management policy: hot -> warm (7d, force-merge) -> cold (30d)
/// -> delete (90d).
pub fn ism_policy(prefix: &str) -> Value {
    json!({
        "policy": {
            "description": "Event index lifecycle policy",
            "default_state": "hot",
            "states": [
                {
                    "name": "hot",
                    "actions": [
                        {
                            "rollover": {
                                "min_size": "50gb",
                                "min_index_age": "1d"
                            }
                        }
                    ],
                    "transitions": [
                        {
                            "state_name": "warm",
                            "conditions": {"min_index_age": "7d"}
                        }
                    ]
                },
                {
                    "name": "warm",
                    "actions": [
                        {"force_merge": {"max_num_segments": 1}}
                    ],
                    "transitions": [
                        {
                            "state_name": "cold",
                            "conditions": {"min_index_age": "30d"}
                        }
                    ]
                },
                {
                    "name": "cold",
                    "actions": [],
                    "transitions": [
                        {
                            "state_name": "delete",
                            "conditions": {"min_index_age": "90d"}
                        }
                    ]
                },
                {
                    "name": "delete",
                    "actions": [{"delete": {}}],
                    "transitions": []
                }
            ],
            "ism_template": {
                "index_patterns": [format!("{prefix}-*")],
                "priority": 100
            }
        }
    })
}
