//! Instructions sent to the vision model alongside each frame.

/// Main proctoring instruction. The JSON schema here is what
/// [`crate::parse::normalise`] expects back.
pub const PROCTOR_PROMPT: &str = r#"AI Exam Proctor: Analyze the webcam image for CLEAR violations during an online exam. Respond ONLY with JSON.

REQUIRED SETUP: Full face visible, seated at desk, facing camera.

FLAG AS VIOLATIONS (severity 3-5):
- Student not visible, partially visible, or only the wall visible
- Multiple people in frame
- Phone or other device in hand
- Reading books or notes
- Talking to someone off-camera

IGNORE (normal behavior):
- Brief glances away, looking up while thinking, adjusting position, touching face

JSON OUTPUT:
{"is_suspicious": false, "confidence": 0.95, "detected_issues": [], "severity": 1, "description": "Brief observation", "alert_type": "none"}

alert_type: "looking_away"|"multiple_people"|"phone_detected"|"reading_from_material"|"student_absent"|"talking_to_someone"|"suspicious_activity"|"none"
Flag is_suspicious=true only if 85%+ confident of a violation."#;

/// Appended when a screen capture accompanies the webcam image.
pub const SCREEN_PROMPT: &str = "Also analyze the screen capture for suspicious activity such as switching tabs, opening unauthorized applications, or searching for answers.";

/// Full prompt for a frame.
pub fn build_prompt(with_screen: bool) -> String {
    if with_screen {
        format!("{PROCTOR_PROMPT}\n\n{SCREEN_PROMPT}")
    } else {
        PROCTOR_PROMPT.to_string()
    }
}
