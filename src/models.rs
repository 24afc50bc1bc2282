//! Platform data models used by the request pipeline.
//!
//! Ids are kept as the decimal strings the platform API sends. Permission
//! bitmasks are `u64` on the wire and converted to serenity's [`Permissions`]
//! where bit operations or names are needed.

use serde::{Deserialize, Serialize};
use serenity::model::Permissions;

/// The logged in user, as returned by `/users/@me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub discriminator: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub global_name: Option<String>,
}

impl User {
    /// Name shown in the panel.
    pub fn display_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.username)
    }
}

/// A guild as seen from the member's side (partial guild).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGuild {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub owner: bool,
    /// Raw permission bits the member holds in this guild.
    #[serde(default, with = "permission_bits")]
    pub permissions: u64,
}

impl UserGuild {
    /// Owners and members with Manage Server may configure the guild.
    pub fn can_manage(&self) -> bool {
        self.owner || as_permissions(self.permissions).contains(Permissions::MANAGE_GUILD)
    }
}

/// A member guild enriched with whether the bot is present in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedGuild {
    #[serde(flatten)]
    pub guild: UserGuild,
    pub connected: bool,
}

impl WrappedGuild {
    pub fn can_manage(&self) -> bool {
        self.guild.can_manage()
    }
}

/// A guild role. Only the fields needed for permission aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, with = "permission_bits")]
    pub permissions: u64,
    #[serde(default)]
    pub position: i64,
}

/// A guild channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: u8,
    #[serde(default)]
    pub position: i64,
}

/// The full guild record.
///
/// A stub built from membership data carries only `id` and `name`; an empty
/// `owner_id` marks it as not yet upgraded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guild {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

impl Guild {
    /// Minimal record built from a member guild.
    pub fn stub(guild: &UserGuild) -> Self {
        Self {
            id: guild.id.clone(),
            name: guild.name.clone(),
            ..Default::default()
        }
    }

    /// Whether owner, region and roles have been populated.
    pub fn is_full(&self) -> bool {
        !self.owner_id.is_empty()
    }

    /// Copy the fields only present on the full record into this one.
    ///
    /// Identity fields and already loaded channels are kept.
    pub fn upgrade_from(&mut self, full: Guild) {
        self.owner_id = full.owner_id;
        self.region = full.region;
        self.roles = full.roles;
    }
}

/// The bot's own membership in a guild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotMember {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub nick: Option<String>,
}

/// Convert raw bits into serenity's permission set, dropping unknown bits.
pub fn as_permissions(bits: u64) -> Permissions {
    Permissions::from_bits_truncate(bits)
}

/// Human readable names for every permission set in `bits`.
pub fn permission_names(bits: u64) -> Vec<&'static str> {
    as_permissions(bits).get_permission_names()
}

/// Permission bits travel as decimal strings but older payloads use numbers.
pub(crate) mod permission_bits {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bits: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&bits.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Bits {
            Text(String),
            Number(u64),
        }

        match Bits::deserialize(deserializer)? {
            Bits::Number(n) => Ok(n),
            Bits::Text(s) => s.parse().map_err(de::Error::custom),
        }
    }
}
