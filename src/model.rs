use chrono::{Datelike, NaiveDate, Weekday};
use regex::Regex;
use std::sync::LazyLock;

static MOBILE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^09\d{9}$").unwrap());
static NATIONAL_CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{10}$").unwrap());
static HOME_PHONE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{8,11}$").unwrap());
static ISO_DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());

pub fn is_mobile(s: &str) -> bool {
    MOBILE_RE.is_match(s)
}

pub fn is_national_code(s: &str) -> bool {
    NATIONAL_CODE_RE.is_match(s)
}

pub fn is_home_phone(s: &str) -> bool {
    HOME_PHONE_RE.is_match(s)
}

/// Strict `YYYY-MM-DD` that is also a real calendar date.
pub fn parse_iso_date(s: &str) -> Option<NaiveDate> {
    if !ISO_DATE_RE.is_match(s) {
        return None;
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

/// A closed set of stored values, each with the Persian label the portal
/// shows, plus extra spellings accepted on input.
#[derive(Debug)]
pub struct Choices {
    pub name: &'static str,
    pub options: &'static [(&'static str, &'static str)],
    pub aliases: &'static [(&'static str, &'static str)],
}

impl Choices {
    pub fn normalize(&self, raw: &str) -> Option<&'static str> {
        let t = raw.trim();
        if t.is_empty() {
            return None;
        }
        for (value, label) in self.options {
            if value.eq_ignore_ascii_case(t) || *label == t {
                return Some(value);
            }
        }
        self.aliases
            .iter()
            .find(|(alias, _)| *alias == t)
            .map(|(_, value)| *value)
    }

    pub fn label<'a>(&self, value: &'a str) -> &'a str {
        self.options
            .iter()
            .find(|(v, _)| *v == value)
            .map(|(_, label)| *label)
            .unwrap_or(value)
    }

    pub fn values(&self) -> Vec<&'static str> {
        self.options.iter().map(|(v, _)| *v).collect()
    }
}

pub const EDUCATION_LEVEL: Choices = Choices {
    name: "education_level",
    options: &[("10", "دهم"), ("11", "یازدهم"), ("12", "دوازدهم")],
    aliases: &[],
};

pub const MARITAL_STATUS: Choices = Choices {
    name: "marital_status",
    options: &[
        ("single", "مجرد"),
        ("married", "متاهل"),
        ("divorced", "طلاق گرفته"),
        ("widowed", "بیوه"),
    ],
    aliases: &[("مطلقه", "divorced")],
};

pub const RESIDENCE_STATUS: Choices = Choices {
    name: "residence_status",
    options: &[("owner", "مالک"), ("tenant", "مستاجر"), ("other", "سایر")],
    aliases: &[],
};

pub const ACADEMIC_STATUS: Choices = Choices {
    name: "academic_status",
    options: &[("high", "بالا"), ("medium", "متوسط"), ("low", "پایین")],
    aliases: &[],
};

pub const EVALUATION_RESULT: Choices = Choices {
    name: "evaluation_result",
    options: &[("accepted", "پذیرفته شده"), ("notAccepted", "پذیرفته نشده")],
    aliases: &[],
};

pub const ACADEMIC_LEVEL: Choices = Choices {
    name: "academic_level",
    options: &[
        ("high_school_diploma", "دیپلم"),
        ("teaching_diploma", "دیپلم تربیت معلم"),
        ("associate_degree", "کاردانی"),
        ("bachelor_degree", "کارشناسی"),
        ("master_degree", "کارشناسی ارشد"),
        ("doctoral_degree", "دکتری"),
        ("postdoctoral", "فوق دکتری"),
        ("other_certification", "سایر"),
    ],
    aliases: &[],
};

pub const ATTENDANCE_STATUS: Choices = Choices {
    name: "status",
    options: &[("present", "حاضر"), ("absent", "غایب"), ("late", "تاخیر")],
    aliases: &[],
};

pub const PERMISSIONS: &[&str] = &[
    "register_student",
    "manage_students",
    "register_teachers",
    "evaluate_performance",
    "academic_counseling",
    "educational_deputy",
    "psych_counselor",
    "principal",
    "manage_users",
    "disciplinary_deputy",
];

/// School week day, Saturday first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Day {
    Saturday,
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
}

impl Day {
    pub const ALL: [Day; 7] = [
        Day::Saturday,
        Day::Sunday,
        Day::Monday,
        Day::Tuesday,
        Day::Wednesday,
        Day::Thursday,
        Day::Friday,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Day::Saturday => "saturday",
            Day::Sunday => "sunday",
            Day::Monday => "monday",
            Day::Tuesday => "tuesday",
            Day::Wednesday => "wednesday",
            Day::Thursday => "thursday",
            Day::Friday => "friday",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let t = s.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|d| d.as_str() == t)
    }

    pub fn of_date(date: NaiveDate) -> Self {
        match date.weekday() {
            Weekday::Sat => Day::Saturday,
            Weekday::Sun => Day::Sunday,
            Weekday::Mon => Day::Monday,
            Weekday::Tue => Day::Tuesday,
            Weekday::Wed => Day::Wednesday,
            Weekday::Thu => Day::Thursday,
            Weekday::Fri => Day::Friday,
        }
    }
}
