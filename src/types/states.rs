use serde::Serialize;

/// The states a [`super::job::Job`] can occupy while it is present in the
/// jobs map. A job that has been `delete`d simply leaves the map — there is
/// no `Invalid` variant here because nothing observable distinguishes "job
/// never existed" from "job was deleted".
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum JobState {
    Ready,
    Delayed,
    Reserved,
    Buried,
}

// This impl is used to allow JobStats to be serialised to YAML.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use JobState::*;

        serializer.serialize_str(match self {
            Ready => "ready",
            Delayed => "delayed",
            Reserved => "reserved",
            Buried => "buried",
        })
    }
}
