use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use crate::rng::Mulberry32;

const FIRST_NAMES: &[&str] = &[
    "Ada", "Alan", "Barbara", "Claude", "Dennis", "Donald", "Edsger", "Frances", "Grace", "Hedy",
    "John", "Katherine", "Ken", "Leslie", "Linus", "Margaret", "Niklaus", "Radia", "Rosalind",
    "Sophie", "Tim", "Tony", "Vint", "Whitfield",
];

const LAST_NAMES: &[&str] = &[
    "Allen", "Baker", "Carter", "Diaz", "Evans", "Fischer", "Garcia", "Hopper", "Ishikawa",
    "Jensen", "Kovacs", "Larsen", "Meyer", "Novak", "Okafor", "Peterson", "Quinn", "Rossi",
    "Schmidt", "Tanaka", "Ueda", "Vargas", "Weber", "Zhang",
];

const CITIES: &[&str] = &[
    "Amsterdam", "Bergen", "Cork", "Dresden", "Edinburgh", "Fukuoka", "Ghent", "Helsinki",
    "Innsbruck", "Jaipur", "Kyoto", "Lyon", "Malmo", "Nantes", "Oporto", "Prague", "Quito",
    "Riga", "Seville", "Tallinn",
];

const COUNTRIES: &[&str] = &[
    "Argentina", "Belgium", "Canada", "Denmark", "Estonia", "Finland", "Germany", "Hungary",
    "Iceland", "Japan", "Kenya", "Latvia", "Mexico", "Norway", "Portugal", "Qatar", "Romania",
    "Sweden", "Thailand", "Uruguay",
];

const STREET_NAMES: &[&str] = &[
    "Maple", "Oak", "Cedar", "Elm", "Willow", "Birch", "Chestnut", "Juniper", "Linden", "Walnut",
];

const STREET_SUFFIXES: &[&str] = &["Street", "Avenue", "Lane", "Road", "Way", "Court"];

const COMPANY_STEMS: &[&str] = &[
    "Acme", "Apex", "Borealis", "Cobalt", "Delta", "Ember", "Forge", "Granite", "Helix", "Ion",
    "Juniper", "Krypton", "Lumen", "Meridian", "Nimbus", "Orbit", "Pinnacle", "Quartz", "Summit",
    "Vertex",
];

const COMPANY_SUFFIXES: &[&str] = &["Labs", "Systems", "Industries", "Group", "Works", "Partners"];

const PRODUCT_ADJECTIVES: &[&str] = &[
    "Compact", "Deluxe", "Ergonomic", "Granular", "Handcrafted", "Modular", "Portable",
    "Rugged", "Sleek", "Refined",
];

const PRODUCT_NOUNS: &[&str] = &[
    "Widget", "Gadget", "Bracket", "Fixture", "Panel", "Adapter", "Sensor", "Switch", "Valve",
    "Module",
];

pub(crate) const LOREM_WORDS: &[&str] = &[
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing", "elit", "sed", "do",
    "eiusmod", "tempor", "incididunt", "ut", "labore", "et", "dolore", "magna", "aliqua",
];

const EMAIL_DOMAINS: &[&str] = &["example.com", "example.org", "example.net", "mail.test"];

/// The deterministic pseudo-random generator surface exposed as `faker.*` in
/// expressions and via the `x-sandbox.faker` schema hint. Every draw
/// consumes the engine's single seeded stream, and dates are relative to the
/// request's fixed `now`.
pub struct Faker<'a> {
    rng: &'a Mulberry32,
    now_ms: i64,
}

impl<'a> Faker<'a> {
    pub fn new(rng: &'a Mulberry32, now_ms: i64) -> Self {
        Self { rng, now_ms }
    }

    pub fn first_name(&self) -> String {
        (*self.rng.pick(FIRST_NAMES)).to_string()
    }

    pub fn last_name(&self) -> String {
        (*self.rng.pick(LAST_NAMES)).to_string()
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name(), self.last_name())
    }

    pub fn email(&self) -> String {
        format!(
            "{}.{}@{}",
            self.first_name().to_lowercase(),
            self.last_name().to_lowercase(),
            self.rng.pick(EMAIL_DOMAINS)
        )
    }

    pub fn username(&self) -> String {
        format!(
            "{}{}",
            self.first_name().to_lowercase(),
            self.rng.int_in_range(1, 999)
        )
    }

    pub fn url(&self) -> String {
        format!(
            "https://{}.{}",
            self.rng.pick(COMPANY_STEMS).to_lowercase(),
            self.rng.pick(EMAIL_DOMAINS)
        )
    }

    pub fn city(&self) -> String {
        (*self.rng.pick(CITIES)).to_string()
    }

    pub fn country(&self) -> String {
        (*self.rng.pick(COUNTRIES)).to_string()
    }

    pub fn zip_code(&self) -> String {
        format!("{:05}", self.rng.int_in_range(1000, 99999))
    }

    pub fn street_name(&self) -> String {
        format!(
            "{} {} {}",
            self.rng.int_in_range(1, 9999),
            self.rng.pick(STREET_NAMES),
            self.rng.pick(STREET_SUFFIXES)
        )
    }

    pub fn company_name(&self) -> String {
        format!(
            "{} {}",
            self.rng.pick(COMPANY_STEMS),
            self.rng.pick(COMPANY_SUFFIXES)
        )
    }

    pub fn product_name(&self) -> String {
        format!(
            "{} {}",
            self.rng.pick(PRODUCT_ADJECTIVES),
            self.rng.pick(PRODUCT_NOUNS)
        )
    }

    pub fn price(&self) -> String {
        format!("{:.2}", self.rng.float_in_range(1.0, 999.0))
    }

    pub fn number(&self) -> i64 {
        self.rng.int_in_range(0, 100_000)
    }

    pub fn boolean(&self) -> bool {
        self.rng.chance(0.5)
    }

    pub fn uuid(&self) -> String {
        self.rng.uuid()
    }

    /// One lorem-ish filler word; used for unconstrained string synthesis.
    pub fn word(&self) -> &'static str {
        *self.rng.pick(LOREM_WORDS)
    }

    /// RFC3339, up to ten days in the past.
    pub fn recent_date(&self) -> String {
        self.format_date(self.now_ms - self.rng.int_in_range(0, 10 * 86_400) * 1000)
    }

    /// RFC3339, up to thirty days ahead.
    pub fn future_date(&self) -> String {
        self.format_date(self.now_ms + self.rng.int_in_range(0, 30 * 86_400) * 1000)
    }

    fn format_date(&self, ms: i64) -> String {
        Utc.timestamp_millis_opt(ms)
            .single()
            .unwrap_or_default()
            .to_rfc3339()
    }

    /// Dispatch by dotted generator path, e.g. `name.firstName` or
    /// `internet.email`. Unknown paths return `None`.
    pub fn invoke(&self, path: &str) -> Option<Value> {
        let value = match path {
            "name.firstName" => json!(self.first_name()),
            "name.lastName" => json!(self.last_name()),
            "name.fullName" => json!(self.full_name()),
            "internet.email" => json!(self.email()),
            "internet.userName" => json!(self.username()),
            "internet.url" => json!(self.url()),
            "address.city" => json!(self.city()),
            "address.country" => json!(self.country()),
            "address.zipCode" => json!(self.zip_code()),
            "address.streetName" => json!(self.street_name()),
            "company.name" => json!(self.company_name()),
            "commerce.productName" => json!(self.product_name()),
            "commerce.price" => json!(self.price()),
            "random.number" => json!(self.number()),
            "random.boolean" => json!(self.boolean()),
            "random.uuid" => json!(self.uuid()),
            "date.recent" => json!(self.recent_date()),
            "date.future" => json!(self.future_date()),
            _ => return None,
        };
        Some(value)
    }
}
