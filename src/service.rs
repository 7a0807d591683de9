// The UPnP service machinery: SCPD tables, their XML rendering, and the
// SOAP control dispatcher that turns an envelope into a typed handler call.

use log::warn;
use url::Url;
use xmltree::Element;

pub const XML_DECLARATION: &str = "<?xml version=\"1.0\"?>\n";

const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

const SOAP_ENCODING_STYLE: &str = "http://schemas.xmlsoap.org/soap/encoding/";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    String,
    Ui4,
    Uri,
}

impl DataType {
    pub const fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Ui4 => "ui4",
            Self::Uri => "uri",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    const fn name(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Argument {
    pub name: &'static str,
    pub direction: Direction,
    pub related_state_variable: &'static str,
}

#[derive(Clone, Debug)]
pub struct Action {
    pub name: &'static str,
    pub arguments: Vec<Argument>,
}

impl Action {
    pub fn argument(&self, name: &str) -> Option<&Argument> {
        self.arguments.iter().find(|a| a.name == name)
    }

    pub fn in_arguments(&self) -> impl Iterator<Item = &Argument> {
        self.arguments
            .iter()
            .filter(|a| a.direction == Direction::In)
    }

    pub fn out_arguments(&self) -> impl Iterator<Item = &Argument> {
        self.arguments
            .iter()
            .filter(|a| a.direction == Direction::Out)
    }
}

#[derive(Clone, Debug)]
pub struct StateVariable {
    pub name: &'static str,
    pub data_type: DataType,
    pub allowed_values: &'static [&'static str],
    pub send_events: bool,
}

#[derive(Clone, Debug)]
pub struct ServiceDescription {
    pub actions: Vec<Action>,
    pub state_variables: Vec<StateVariable>,
}

impl ServiceDescription {
    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn state_variable(&self, name: &str) -> Option<&StateVariable> {
        self.state_variables.iter().find(|v| v.name == name)
    }

    /// The static SCPD document served at `/<i>/service`.
    pub fn render_scpd(&self) -> String {
        let mut scpd = String::from(XML_DECLARATION);
        scpd.push_str(
            r#"<scpd xmlns="urn:schemas-upnp-org:service-1-0"><specVersion><major>1</major><minor>0</minor></specVersion><actionList>"#,
        );

        for action in &self.actions {
            scpd.push_str(&format!("<action><name>{}</name><argumentList>", action.name));
            for argument in &action.arguments {
                scpd.push_str(&format!(
                    "<argument><name>{}</name><direction>{}</direction><relatedStateVariable>{}</relatedStateVariable></argument>",
                    argument.name,
                    argument.direction.name(),
                    argument.related_state_variable,
                ));
            }
            scpd.push_str("</argumentList></action>");
        }

        scpd.push_str("</actionList><serviceStateTable>");
        for variable in &self.state_variables {
            let send_events = if variable.send_events { "yes" } else { "no" };
            scpd.push_str(&format!(
                "<stateVariable sendEvents=\"{send_events}\"><name>{}</name><dataType>{}</dataType>",
                variable.name,
                variable.data_type.name(),
            ));
            if !variable.allowed_values.is_empty() {
                scpd.push_str("<allowedValueList>");
                for value in variable.allowed_values {
                    scpd.push_str(&format!("<allowedValue>{value}</allowedValue>"));
                }
                scpd.push_str("</allowedValueList>");
            }
            scpd.push_str("</stateVariable>");
        }
        scpd.push_str("</serviceStateTable></scpd>");

        scpd
    }
}

/// A SOAP argument value, typed by its related state variable.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    String(String),
    Ui4(u32),
    Uri(Url),
}

impl Value {
    pub fn render(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Ui4(n) => n.to_string(),
            Self::Uri(u) => u.to_string(),
        }
    }
}

#[derive(Debug)]
pub enum ControlError {
    InvalidEnvelope(String),
    UnsupportedAction(String),
    InvalidArguments(String),
    NotImplemented(&'static str),
    ActionFailed(String),
}

impl ControlError {
    /// UPnP error codes per the device architecture's control clause.
    pub const fn error_code(&self) -> u16 {
        match self {
            Self::UnsupportedAction(_) => 401,
            Self::InvalidEnvelope(_) | Self::InvalidArguments(_) => 402,
            Self::ActionFailed(_) => 501,
            Self::NotImplemented(_) => 602,
        }
    }

    pub const fn error_description(&self) -> &'static str {
        match self {
            Self::UnsupportedAction(_) => "Invalid Action",
            Self::InvalidEnvelope(_) | Self::InvalidArguments(_) => "Invalid Args",
            Self::ActionFailed(_) => "Action Failed",
            Self::NotImplemented(_) => "Not Implemented",
        }
    }
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::InvalidEnvelope(msg) => write!(f, "invalid soap envelope: {msg}"),
            Self::UnsupportedAction(action) => write!(f, "unsupported action: {action}"),
            Self::InvalidArguments(msg) => write!(f, "invalid arguments: {msg}"),
            Self::NotImplemented(what) => write!(f, "not implemented: {what}"),
            Self::ActionFailed(msg) => write!(f, "action failed: {msg}"),
        }
    }
}

impl std::error::Error for ControlError {}

/// What a service implementation plugs in: one call per SCPD action, inputs
/// already coerced and ordered per the action's `in` argument list, outputs
/// expected to line up with its `out` argument list.
pub trait ActionHandler: Send + Sync {
    fn call(&self, action: &str, inputs: &[Value]) -> Result<Vec<Value>, ControlError>;
}

pub struct Service {
    pub id: &'static str,
    pub service_type: &'static str,
    pub description: ServiceDescription,
    pub implementation: Box<dyn ActionHandler>,
}

impl Service {
    /// The whole control path: decode the envelope, identify the action by
    /// its element name, coerce the arguments by their related state
    /// variables, invoke the implementation, encode the response envelope.
    pub fn control(&self, body: &str) -> Result<String, ControlError> {
        let (action_name, provided) = parse_envelope(body)?;

        let action = self
            .description
            .action(&action_name)
            .ok_or_else(|| ControlError::UnsupportedAction(action_name.clone()))?;

        let inputs = self.coerce_inputs(action, &provided)?;
        let outputs = self.implementation.call(action.name, &inputs)?;
        self.encode_response(action, &outputs)
    }

    fn coerce_inputs(
        &self,
        action: &Action,
        provided: &[(String, String)],
    ) -> Result<Vec<Value>, ControlError> {
        for (name, _) in provided {
            if action.argument(name).is_none() {
                warn!("{}: ignoring unexpected argument {name}", action.name);
            }
        }

        let mut inputs = Vec::new();
        for argument in action.in_arguments() {
            let Some((_, text)) = provided.iter().find(|(name, _)| name == argument.name) else {
                return Err(ControlError::InvalidArguments(format!(
                    "missing argument {}",
                    argument.name
                )));
            };

            let variable = self
                .description
                .state_variable(argument.related_state_variable)
                .ok_or_else(|| {
                    ControlError::ActionFailed(format!(
                        "no state variable {} for argument {}",
                        argument.related_state_variable, argument.name
                    ))
                })?;

            inputs.push(match variable.data_type {
                DataType::String => Value::String(text.clone()),
                DataType::Ui4 => Value::Ui4(text.parse().map_err(|_| {
                    ControlError::InvalidArguments(format!(
                        "{} is not a ui4: {text:?}",
                        argument.name
                    ))
                })?),
                DataType::Uri => Value::Uri(Url::parse(text).map_err(|err| {
                    ControlError::InvalidArguments(format!(
                        "{} is not a uri: {err}",
                        argument.name
                    ))
                })?),
            });
        }

        Ok(inputs)
    }

    fn encode_response(&self, action: &Action, outputs: &[Value]) -> Result<String, ControlError> {
        let out_arguments: Vec<&Argument> = action.out_arguments().collect();
        if out_arguments.len() != outputs.len() {
            return Err(ControlError::ActionFailed(format!(
                "{} produced {} outputs, description declares {}",
                action.name,
                outputs.len(),
                out_arguments.len()
            )));
        }

        let mut arguments = String::new();
        for (argument, value) in out_arguments.iter().zip(outputs) {
            let name = argument.name;
            let text = xml::escape::escape_str_attribute(&value.render()).into_owned();
            arguments.push_str(&format!("<{name}>{text}</{name}>"));
        }

        let action_name = action.name;
        let service_type = self.service_type;
        Ok(format!(
            r#"{XML_DECLARATION}<s:Envelope xmlns:s="{SOAP_ENVELOPE_NS}" s:encodingStyle="{SOAP_ENCODING_STYLE}"><s:Body><u:{action_name}Response xmlns:u="{service_type}">{arguments}</u:{action_name}Response></s:Body></s:Envelope>"#
        ))
    }
}

/// Structural decode: the envelope's body holds exactly one element whose
/// local name is the action, whose children are named argument elements
/// carrying text.
fn parse_envelope(body: &str) -> Result<(String, Vec<(String, String)>), ControlError> {
    let envelope = Element::parse(body.as_bytes())
        .map_err(|err| ControlError::InvalidEnvelope(err.to_string()))?;

    let body_element = envelope
        .get_child("Body")
        .ok_or_else(|| ControlError::InvalidEnvelope("no Body element".to_string()))?;

    let action_element = body_element
        .children
        .iter()
        .filter_map(|c| c.as_element())
        .next()
        .ok_or_else(|| ControlError::InvalidEnvelope("empty Body element".to_string()))?;

    let arguments = action_element
        .children
        .iter()
        .filter_map(|c| c.as_element())
        .map(|el| {
            (
                el.name.clone(),
                el.get_text().map_or_else(String::new, |t| t.into_owned()),
            )
        })
        .collect();

    Ok((action_element.name.clone(), arguments))
}

/// The answer for a control point that asked for something we cannot do:
/// HTTP 500 with a UPnPError detail block.
pub fn soap_fault(error: &ControlError) -> String {
    let error_code = error.error_code();
    let error_description = error.error_description();
    format!(
        r#"{XML_DECLARATION}<s:Envelope xmlns:s="{SOAP_ENVELOPE_NS}" s:encodingStyle="{SOAP_ENCODING_STYLE}"><s:Body><s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring><detail><UPnPError xmlns="urn:schemas-upnp-org:control-1-0"><errorCode>{error_code}</errorCode><errorDescription>{error_description}</errorDescription></UPnPError></detail></s:Fault></s:Body></s:Envelope>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_description() -> ServiceDescription {
        ServiceDescription {
            actions: vec![
                Action {
                    name: "Echo",
                    arguments: vec![
                        Argument {
                            name: "Text",
                            direction: Direction::In,
                            related_state_variable: "A_ARG_TYPE_Text",
                        },
                        Argument {
                            name: "Repeat",
                            direction: Direction::In,
                            related_state_variable: "A_ARG_TYPE_Count",
                        },
                        Argument {
                            name: "Source",
                            direction: Direction::In,
                            related_state_variable: "A_ARG_TYPE_Location",
                        },
                        Argument {
                            name: "Result",
                            direction: Direction::Out,
                            related_state_variable: "A_ARG_TYPE_Text",
                        },
                    ],
                },
                Action {
                    name: "Fails",
                    arguments: vec![],
                },
            ],
            state_variables: vec![
                StateVariable {
                    name: "A_ARG_TYPE_Text",
                    data_type: DataType::String,
                    allowed_values: &[],
                    send_events: false,
                },
                StateVariable {
                    name: "A_ARG_TYPE_Count",
                    data_type: DataType::Ui4,
                    allowed_values: &[],
                    send_events: false,
                },
                StateVariable {
                    name: "A_ARG_TYPE_Location",
                    data_type: DataType::Uri,
                    allowed_values: &["http://example.com/"],
                    send_events: true,
                },
            ],
        }
    }

    struct Echo;

    impl ActionHandler for Echo {
        fn call(&self, action: &str, inputs: &[Value]) -> Result<Vec<Value>, ControlError> {
            match action {
                "Echo" => {
                    let [Value::String(text), Value::Ui4(repeat), Value::Uri(_)] = inputs else {
                        return Err(ControlError::InvalidArguments(
                            "unexpected Echo argument shape".to_string(),
                        ));
                    };
                    Ok(vec![Value::String(text.repeat(*repeat as usize))])
                }
                "Fails" => Err(ControlError::ActionFailed("on purpose".to_string())),
                _ => Err(ControlError::UnsupportedAction(action.to_string())),
            }
        }
    }

    fn echo_service() -> Service {
        Service {
            id: "urn:example-com:serviceId:Echo",
            service_type: "urn:example-com:service:Echo:1",
            description: echo_description(),
            implementation: Box::new(Echo),
        }
    }

    fn echo_envelope(text: &str, repeat: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
    <s:Body>
        <u:Echo xmlns:u="urn:example-com:service:Echo:1">
            <Text>{text}</Text>
            <Repeat>{repeat}</Repeat>
            <Source>http://192.168.1.20/x</Source>
        </u:Echo>
    </s:Body>
</s:Envelope>"#
        )
    }

    #[test]
    fn test_control_dispatches_and_encodes_the_response() {
        let service = echo_service();

        let response = service.control(&echo_envelope("ab", "3")).unwrap();

        assert!(response.starts_with(XML_DECLARATION));
        let envelope = Element::parse(response.as_bytes()).unwrap();
        let body = envelope.get_child("Body").unwrap();
        let echo_response = body.get_child("EchoResponse").unwrap();
        assert_eq!(echo_response.prefix.as_deref(), Some("u"));
        let result = echo_response.get_child("Result").unwrap();
        assert_eq!(result.get_text().unwrap(), "ababab");
    }

    #[test]
    fn test_control_rejects_unknown_actions() {
        let service = echo_service();
        let body = r#"<Envelope><Body><Reverse><Text>x</Text></Reverse></Body></Envelope>"#;

        let err = service.control(body).unwrap_err();
        assert!(matches!(err, ControlError::UnsupportedAction(_)));
        assert_eq!(err.error_code(), 401);
    }

    #[test]
    fn test_control_rejects_bad_ui4() {
        let service = echo_service();

        let err = service.control(&echo_envelope("x", "minus one")).unwrap_err();
        assert!(matches!(err, ControlError::InvalidArguments(_)));
        assert_eq!(err.error_code(), 402);

        let err = service.control(&echo_envelope("x", "-1")).unwrap_err();
        assert!(matches!(err, ControlError::InvalidArguments(_)));
    }

    #[test]
    fn test_control_rejects_missing_arguments() {
        let service = echo_service();
        let body = r#"<Envelope><Body><Echo><Text>x</Text></Echo></Body></Envelope>"#;

        let err = service.control(body).unwrap_err();
        assert!(matches!(err, ControlError::InvalidArguments(_)));
    }

    #[test]
    fn test_control_rejects_garbage_envelopes() {
        let service = echo_service();

        let err = service.control("not xml at all").unwrap_err();
        assert!(matches!(err, ControlError::InvalidEnvelope(_)));

        let err = service.control("<Envelope></Envelope>").unwrap_err();
        assert!(matches!(err, ControlError::InvalidEnvelope(_)));

        let err = service.control("<Envelope><Body/></Envelope>").unwrap_err();
        assert!(matches!(err, ControlError::InvalidEnvelope(_)));
    }

    #[test]
    fn test_handler_failures_propagate() {
        let service = echo_service();
        let body = r#"<Envelope><Body><Fails/></Body></Envelope>"#;

        let err = service.control(body).unwrap_err();
        assert!(matches!(err, ControlError::ActionFailed(_)));
        assert_eq!(err.error_code(), 501);
    }

    #[test]
    fn test_render_scpd() {
        let description = echo_description();
        let scpd = description.render_scpd();

        assert!(scpd.starts_with("<?xml version=\"1.0\"?>\n<scpd xmlns=\"urn:schemas-upnp-org:service-1-0\">"));

        let document = Element::parse(scpd.as_bytes()).unwrap();
        let action_list = document.get_child("actionList").unwrap();
        let action = action_list.get_child("action").unwrap();
        assert_eq!(action.get_child("name").unwrap().get_text().unwrap(), "Echo");
        let argument = action
            .get_child("argumentList")
            .unwrap()
            .get_child("argument")
            .unwrap();
        assert_eq!(
            argument.get_child("direction").unwrap().get_text().unwrap(),
            "in"
        );
        assert_eq!(
            argument
                .get_child("relatedStateVariable")
                .unwrap()
                .get_text()
                .unwrap(),
            "A_ARG_TYPE_Text"
        );

        // sendEvents renders yes/no, allowed values make it through
        assert!(scpd.contains(r#"<stateVariable sendEvents="no"><name>A_ARG_TYPE_Text</name><dataType>string</dataType></stateVariable>"#));
        assert!(scpd.contains(r#"<stateVariable sendEvents="yes"><name>A_ARG_TYPE_Location</name><dataType>uri</dataType><allowedValueList><allowedValue>http://example.com/</allowedValue></allowedValueList></stateVariable>"#));
    }

    #[test]
    fn test_soap_fault_shape() {
        let fault = soap_fault(&ControlError::NotImplemented("BrowseMetadata"));

        let envelope = Element::parse(fault.as_bytes()).unwrap();
        let fault_element = envelope
            .get_child("Body")
            .unwrap()
            .get_child("Fault")
            .unwrap();
        assert_eq!(
            fault_element
                .get_child("faultstring")
                .unwrap()
                .get_text()
                .unwrap(),
            "UPnPError"
        );
        let upnp_error = fault_element
            .get_child("detail")
            .unwrap()
            .get_child("UPnPError")
            .unwrap();
        assert_eq!(
            upnp_error.get_child("errorCode").unwrap().get_text().unwrap(),
            "602"
        );
        assert_eq!(
            upnp_error
                .get_child("errorDescription")
                .unwrap()
                .get_text()
                .unwrap(),
            "Not Implemented"
        );
    }

    #[test]
    fn test_response_output_count_mismatch_fails() {
        struct TooMany;
        impl ActionHandler for TooMany {
            fn call(&self, _action: &str, _inputs: &[Value]) -> Result<Vec<Value>, ControlError> {
                Ok(vec![
                    Value::String("a".to_string()),
                    Value::String("b".to_string()),
                ])
            }
        }

        let service = Service {
            id: "urn:example-com:serviceId:Echo",
            service_type: "urn:example-com:service:Echo:1",
            description: echo_description(),
            implementation: Box::new(TooMany),
        };

        let err = service.control(&echo_envelope("x", "1")).unwrap_err();
        assert!(matches!(err, ControlError::ActionFailed(_)));
    }
}
