//! Admission evaluation: the five evaluator roles and the rule that folds their
//! decisions into `students.accepted`.

use rusqlite::{Connection, OptionalExtension};

/// Minimum number of accepting roles for a student to be admitted.
pub const ACCEPTANCE_THRESHOLD: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionRole {
    AcademicAdvisor,
    DisciplinaryDeputy,
    EducationalDeputy,
    Principal,
    PsychCounselor,
}

impl DecisionRole {
    pub const ALL: [DecisionRole; 5] = [
        DecisionRole::AcademicAdvisor,
        DecisionRole::DisciplinaryDeputy,
        DecisionRole::EducationalDeputy,
        DecisionRole::Principal,
        DecisionRole::PsychCounselor,
    ];

    /// Stored in `decisions.role`.
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionRole::AcademicAdvisor => "academic_advisor",
            DecisionRole::DisciplinaryDeputy => "disciplinary_deputy",
            DecisionRole::EducationalDeputy => "educational_deputy",
            DecisionRole::Principal => "principal",
            DecisionRole::PsychCounselor => "psych_counselor",
        }
    }

    /// First path segment under `/api`.
    pub fn route_segment(self) -> &'static str {
        match self {
            DecisionRole::AcademicAdvisor => "academic-advisor",
            DecisionRole::DisciplinaryDeputy => "disciplinary-deputy",
            DecisionRole::EducationalDeputy => "educational-deputy",
            DecisionRole::Principal => "principal",
            DecisionRole::PsychCounselor => "psych-counselor",
        }
    }

    pub fn from_route_segment(seg: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.route_segment() == seg)
    }

    /// Staff permission that grants access to this role's forms.
    pub fn permission(self) -> &'static str {
        match self {
            DecisionRole::AcademicAdvisor => "academic_counseling",
            DecisionRole::DisciplinaryDeputy => "disciplinary_deputy",
            DecisionRole::EducationalDeputy => "educational_deputy",
            DecisionRole::Principal => "principal",
            DecisionRole::PsychCounselor => "psych_counselor",
        }
    }

    /// Name of the boolean decision field in request and response bodies.
    pub fn decision_field(self) -> &'static str {
        match self {
            DecisionRole::AcademicAdvisor => "advisorDecision",
            DecisionRole::DisciplinaryDeputy | DecisionRole::EducationalDeputy => "deputyDecision",
            DecisionRole::Principal => "principalDecision",
            DecisionRole::PsychCounselor => "psychDecision",
        }
    }

    /// Free-text assessment fields the role records alongside its decision.
    pub fn assessment_fields(self) -> &'static [&'static str] {
        match self {
            DecisionRole::AcademicAdvisor => &[
                "academicStrengths",
                "academicWeaknesses",
                "academicInterests",
                "preferredMajor",
                "disciplineStatus",
                "dailyStudyHours",
                "extraActivities",
                "needsTutoring",
                "classParticipation",
                "homeworkStatus",
                "learningSkills",
                "advisorNotes",
            ],
            DecisionRole::DisciplinaryDeputy => &[
                "pastDisciplinaryRecords",
                "lastYearDisciplinaryReport",
                "classBehavior",
                "reportedIncidents",
                "peerConflicts",
                "ruleCompliance",
                "teacherInteractions",
                "specialSupervisionNeeds",
                "disciplinarySuggestions",
                "deputyNotes",
            ],
            DecisionRole::EducationalDeputy => &[
                "submittedDocuments",
                "lastYearReport",
                "coreSubjectsScore",
                "disciplineStatus",
                "attendanceHistory",
                "transferStatus",
                "foreignLanguageLevel",
                "classEngagement",
                "pastIssues",
                "specialRequirements",
                "classPlacementSuggestion",
                "academicHistory",
                "deputyNotes",
            ],
            DecisionRole::Principal => &[
                "familyStatus",
                "residenceStatus",
                "disciplineStatus",
                "advisorReport",
                "deputyReport",
                "parentCooperation",
                "specialTalents",
                "specialNeeds",
                "familyGoals",
                "schoolHistory",
                "socialBehavior",
                "principalEvaluation",
                "principalNotes",
            ],
            DecisionRole::PsychCounselor => &[
                "mentalStatus",
                "confidenceLevel",
                "stressLevel",
                "socialSkills",
                "peerRelations",
                "parentRelations",
                "familyIssues",
                "counselingHistory",
                "behaviorIssues",
                "personalityStrengths",
                "learningStyle",
                "studyMotivation",
                "psychNotes",
            ],
        }
    }
}

/// Accepts booleans and the labels the portal forms submit.
pub fn parse_decision(v: &serde_json::Value) -> Option<bool> {
    match v {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::String(s) => match s.trim() {
            "true" | "accept" | "accepted" | "پذیرش" => Some(true),
            "false" | "reject" | "rejected" | "عدم پذیرش" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Folds one decision per role into an admission result.
///
/// `None` while any role is still pending, otherwise whether at least
/// [`ACCEPTANCE_THRESHOLD`] roles accepted.
pub fn aggregate_decisions(decisions: &[Option<bool>]) -> Option<bool> {
    let mut accepted = 0usize;
    for d in decisions {
        match d {
            None => return None,
            Some(true) => accepted += 1,
            Some(false) => {}
        }
    }
    Some(accepted >= ACCEPTANCE_THRESHOLD)
}

pub fn load_decisions(
    conn: &Connection,
    student_id: &str,
) -> rusqlite::Result<[Option<bool>; 5]> {
    let mut out = [None; 5];
    for (slot, role) in out.iter_mut().zip(DecisionRole::ALL) {
        *slot = conn
            .query_row(
                "SELECT decision FROM decisions WHERE role = ? AND student_id = ?",
                (role.as_str(), student_id),
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .map(|v| v != 0);
    }
    Ok(out)
}

pub fn check_student_accepted(conn: &Connection, student_id: &str) -> rusqlite::Result<Option<bool>> {
    let decisions = load_decisions(conn, student_id)?;
    Ok(aggregate_decisions(&decisions))
}

/// Recomputes and stores `students.accepted`. Pending results leave the row
/// untouched; an unknown student id updates nothing.
pub fn refresh_student_acceptance(
    conn: &Connection,
    student_id: &str,
) -> rusqlite::Result<Option<bool>> {
    let accepted = check_student_accepted(conn, student_id)?;
    if let Some(v) = accepted {
        conn.execute(
            "UPDATE students SET accepted = ? WHERE id = ?",
            (v as i64, student_id),
        )?;
    }
    Ok(accepted)
}
