use rumqttc::QoS;

pub const CONNECTED: &str = "CONNECTED";
pub const DISCONNECTED: &str = "DISCONNECTED";
pub const UPDATE_STARTED: &str = "START UPDATING FIRMWARE";
pub const UPDATE_DONE: &str = "DONE UPDATING FIRMWARE";

/// QoS of the retained presence announcement and the last-will.
pub const STATUS_QOS: QoS = QoS::ExactlyOnce;
pub const LEVEL_QOS: QoS = QoS::AtLeastOnce;
pub const SET_LEVEL_QOS: QoS = QoS::ExactlyOnce;
pub const GET_LEVEL_QOS: QoS = QoS::AtMostOnce;

/// Full topic names derived from the configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub status: String,
    pub level: String,
    pub set_level: String,
    pub get_level: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        let status = prefix.trim_end_matches('/').to_string();
        Self {
            level: join_topic(&status, "lightlevel"),
            set_level: join_topic(&status, "setlightlevel"),
            get_level: join_topic(&status, "getlightlevel"),
            status,
        }
    }
}

/// Joins prefix and subtopic with exactly one `/`. An empty subtopic yields the prefix.
pub fn join_topic(prefix: &str, subtopic: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let subtopic = subtopic.trim_start_matches('/');
    if subtopic.is_empty() {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix, subtopic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserts_exactly_one_separator() {
        assert_eq!(join_topic("home/hall", "lightlevel"), "home/hall/lightlevel");
        assert_eq!(join_topic("home/hall/", "lightlevel"), "home/hall/lightlevel");
        assert_eq!(join_topic("home/hall", "/lightlevel"), "home/hall/lightlevel");
        assert_eq!(join_topic("home/hall//", "//lightlevel"), "home/hall/lightlevel");
        assert_eq!(join_topic("home/hall", ""), "home/hall");
    }

    #[test]
    fn derives_all_topics_from_prefix() {
        let topics = Topics::new("home/entrance-wardrobe/");
        assert_eq!(topics.status, "home/entrance-wardrobe");
        assert_eq!(topics.level, "home/entrance-wardrobe/lightlevel");
        assert_eq!(topics.set_level, "home/entrance-wardrobe/setlightlevel");
        assert_eq!(topics.get_level, "home/entrance-wardrobe/getlightlevel");
    }
}
