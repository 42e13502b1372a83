use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey,
                   Header, Validation};
use serde::{Deserialize, Serialize};

/* ------------ 聽眾 / 控制端 token ------------ */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub exp: i64,
}

impl Claims {
    pub fn display_name(&self) -> &str { self.name.as_deref().unwrap_or(&self.sub) }
}

#[cfg(test)]
pub fn sign(uid:&str, name:Option<&str>, secret:&str) -> jsonwebtoken::errors::Result<String> {
    let c = Claims { sub: uid.into(), name: name.map(Into::into), exp: Utc::now().timestamp()+86_400 };
    encode(&Header::default(), &c, &EncodingKey::from_secret(secret.as_bytes()))
}

pub fn verify(token:&str, secret:&str) -> Option<Claims> {
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()),
                     &Validation::new(Algorithm::HS256))
        .map(|d| d.claims).ok()
}

/* ------------ 中繼 (SFU) access token ------------ */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayGrant {
    pub room: String,
    pub room_join: bool,
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub ingress_admin: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct RelayClaims {
    iss:   String,
    sub:   String,
    name:  String,
    nbf:   i64,
    exp:   i64,
    video: RelayGrant,
}

/// Short-lived publisher token: the bot joins and publishes, never subscribes.
pub fn relay_token(key:&str, secret:&str, identity:&str, name:&str, grant:RelayGrant)
    -> jsonwebtoken::errors::Result<String>
{
    let now = Utc::now().timestamp();
    let c = RelayClaims {
        iss: key.into(), sub: identity.into(), name: name.into(),
        nbf: now, exp: now + 6 * 3600, video: grant,
    };
    encode(&Header::new(Algorithm::HS256), &c, &EncodingKey::from_secret(secret.as_bytes()))
}
