use std::sync::Arc;

use log::debug;
use url::Url;

use crate::collection::{Collection, Entry};
use crate::didl;
use crate::service::{
    Action, ActionHandler, Argument, ControlError, DataType, Direction, Service,
    ServiceDescription, StateVariable, Value,
};

pub const SERVICE_TYPE: &str = "urn:schemas-upnp-org:service:ContentDirectory:1";

pub const SERVICE_ID: &str = "urn:upnp-org:serviceId:ContentDirectory";

const BROWSE_METADATA: &str = "BrowseMetadata";

const BROWSE_DIRECT_CHILDREN: &str = "BrowseDirectChildren";

const ARG_TYPE_OBJECT_ID: &str = "A_ARG_TYPE_ObjectID";
const ARG_TYPE_RESULT: &str = "A_ARG_TYPE_Result";
const ARG_TYPE_SEARCH_CRITERIA: &str = "A_ARG_TYPE_SearchCriteria";
const ARG_TYPE_BROWSE_FLAG: &str = "A_ARG_TYPE_BrowseFlag";
const ARG_TYPE_FILTER: &str = "A_ARG_TYPE_Filter";
const ARG_TYPE_SORT_CRITERIA: &str = "A_ARG_TYPE_SortCriteria";
const ARG_TYPE_INDEX: &str = "A_ARG_TYPE_Index";
const ARG_TYPE_COUNT: &str = "A_ARG_TYPE_Count";
const ARG_TYPE_UPDATE_ID: &str = "A_ARG_TYPE_UpdateID";
const ARG_TYPE_TRANSFER_ID: &str = "A_ARG_TYPE_TransferID";
const ARG_TYPE_TRANSFER_STATUS: &str = "A_ARG_TYPE_TransferStatus";
const ARG_TYPE_TRANSFER_LENGTH: &str = "A_ARG_TYPE_TransferLength";
const ARG_TYPE_TRANSFER_TOTAL: &str = "A_ARG_TYPE_TransferTotal";
const ARG_TYPE_TAG_VALUE_LIST: &str = "A_ARG_TYPE_TagValueList";
const ARG_TYPE_URI: &str = "A_ARG_TYPE_URI";

pub fn service(collection: Arc<Collection>, base_url: Url) -> Service {
    Service {
        id: SERVICE_ID,
        service_type: SERVICE_TYPE,
        description: description(),
        implementation: Box::new(ContentDirectory {
            collection,
            base_url,
        }),
    }
}

const fn arg_in(name: &'static str, related: &'static str) -> Argument {
    Argument {
        name,
        direction: Direction::In,
        related_state_variable: related,
    }
}

const fn arg_out(name: &'static str, related: &'static str) -> Argument {
    Argument {
        name,
        direction: Direction::Out,
        related_state_variable: related,
    }
}

const fn variable(name: &'static str, data_type: DataType) -> StateVariable {
    StateVariable {
        name,
        data_type,
        allowed_values: &[],
        send_events: false,
    }
}

/// The ContentDirectory:1 service description: the full action table a
/// control point expects to find, even though most of the transfer actions
/// answer with empty success.
pub fn description() -> ServiceDescription {
    ServiceDescription {
        actions: vec![
            Action {
                name: "GetSearchCapabilities",
                arguments: vec![arg_out("SearchCaps", "SearchCapabilities")],
            },
            Action {
                name: "GetSortCapabilities",
                arguments: vec![arg_out("SortCaps", "SortCapabilities")],
            },
            Action {
                name: "GetSystemUpdateID",
                arguments: vec![arg_out("Id", "SystemUpdateID")],
            },
            Action {
                name: "Browse",
                arguments: vec![
                    arg_in("ObjectID", ARG_TYPE_OBJECT_ID),
                    arg_in("BrowseFlag", ARG_TYPE_BROWSE_FLAG),
                    arg_in("Filter", ARG_TYPE_FILTER),
                    arg_in("StartingIndex", ARG_TYPE_INDEX),
                    arg_in("RequestedCount", ARG_TYPE_COUNT),
                    arg_in("SortCriteria", ARG_TYPE_SORT_CRITERIA),
                    arg_out("Result", ARG_TYPE_RESULT),
                    arg_out("NumberReturned", ARG_TYPE_COUNT),
                    arg_out("TotalMatches", ARG_TYPE_COUNT),
                    arg_out("UpdateID", ARG_TYPE_UPDATE_ID),
                ],
            },
            Action {
                name: "Search",
                arguments: vec![
                    arg_in("ContainerID", ARG_TYPE_OBJECT_ID),
                    arg_in("SearchCriteria", ARG_TYPE_SEARCH_CRITERIA),
                    arg_in("Filter", ARG_TYPE_FILTER),
                    arg_in("StartingIndex", ARG_TYPE_INDEX),
                    arg_in("RequestedCount", ARG_TYPE_COUNT),
                    arg_in("SortCriteria", ARG_TYPE_SORT_CRITERIA),
                    arg_out("Result", ARG_TYPE_RESULT),
                    arg_out("NumberReturned", ARG_TYPE_COUNT),
                    arg_out("TotalMatches", ARG_TYPE_COUNT),
                    arg_out("UpdateID", ARG_TYPE_UPDATE_ID),
                ],
            },
            Action {
                name: "CreateObject",
                arguments: vec![
                    arg_in("ContainerID", ARG_TYPE_OBJECT_ID),
                    arg_in("Elements", ARG_TYPE_RESULT),
                    arg_out("ObjectID", ARG_TYPE_OBJECT_ID),
                    arg_out("Result", ARG_TYPE_RESULT),
                ],
            },
            Action {
                name: "DestroyObject",
                arguments: vec![arg_in("ObjectID", ARG_TYPE_OBJECT_ID)],
            },
            Action {
                name: "UpdateObject",
                arguments: vec![
                    arg_in("ObjectID", ARG_TYPE_OBJECT_ID),
                    arg_in("CurrentTagValue", ARG_TYPE_TAG_VALUE_LIST),
                    arg_in("NewTagValue", ARG_TYPE_TAG_VALUE_LIST),
                ],
            },
            Action {
                name: "ImportResource",
                arguments: vec![
                    arg_in("SourceURI", ARG_TYPE_URI),
                    arg_in("DestinationURI", ARG_TYPE_URI),
                    arg_out("TransferID", ARG_TYPE_TRANSFER_ID),
                ],
            },
            Action {
                name: "ExportResource",
                arguments: vec![
                    arg_in("SourceURI", ARG_TYPE_URI),
                    arg_in("DestinationURI", ARG_TYPE_URI),
                    arg_out("TransferID", ARG_TYPE_TRANSFER_ID),
                ],
            },
            Action {
                name: "StopTransferResource",
                arguments: vec![arg_in("TransferID", ARG_TYPE_TRANSFER_ID)],
            },
            Action {
                name: "GetTransferProgress",
                arguments: vec![
                    arg_in("TransferID", ARG_TYPE_TRANSFER_ID),
                    arg_out("TransferStatus", ARG_TYPE_TRANSFER_STATUS),
                    arg_out("TransferLength", ARG_TYPE_TRANSFER_LENGTH),
                    arg_out("TransferTotal", ARG_TYPE_TRANSFER_TOTAL),
                ],
            },
            Action {
                name: "DeleteResource",
                arguments: vec![arg_in("ResourceURI", ARG_TYPE_URI)],
            },
            Action {
                name: "CreateReference",
                arguments: vec![
                    arg_in("ContainerID", ARG_TYPE_OBJECT_ID),
                    arg_in("ObjectID", ARG_TYPE_OBJECT_ID),
                    arg_out("NewID", ARG_TYPE_OBJECT_ID),
                ],
            },
        ],
        state_variables: vec![
            StateVariable {
                name: "TransferIDs",
                data_type: DataType::String,
                allowed_values: &[],
                send_events: true,
            },
            variable(ARG_TYPE_OBJECT_ID, DataType::String),
            variable(ARG_TYPE_RESULT, DataType::String),
            variable(ARG_TYPE_SEARCH_CRITERIA, DataType::String),
            StateVariable {
                name: ARG_TYPE_BROWSE_FLAG,
                data_type: DataType::String,
                allowed_values: &[BROWSE_METADATA, BROWSE_DIRECT_CHILDREN],
                send_events: false,
            },
            variable(ARG_TYPE_FILTER, DataType::String),
            variable(ARG_TYPE_SORT_CRITERIA, DataType::String),
            variable(ARG_TYPE_INDEX, DataType::Ui4),
            variable(ARG_TYPE_COUNT, DataType::Ui4),
            variable(ARG_TYPE_UPDATE_ID, DataType::Ui4),
            variable(ARG_TYPE_TRANSFER_ID, DataType::Ui4),
            StateVariable {
                name: ARG_TYPE_TRANSFER_STATUS,
                data_type: DataType::String,
                allowed_values: &["COMPLETED", "ERROR", "IN_PROGRESS", "STOPPED"],
                send_events: false,
            },
            variable(ARG_TYPE_TRANSFER_LENGTH, DataType::String),
            variable(ARG_TYPE_TRANSFER_TOTAL, DataType::String),
            variable(ARG_TYPE_TAG_VALUE_LIST, DataType::String),
            variable(ARG_TYPE_URI, DataType::Uri),
            variable("SearchCapabilities", DataType::String),
            variable("SortCapabilities", DataType::String),
            StateVariable {
                name: "SystemUpdateID",
                data_type: DataType::Ui4,
                allowed_values: &[],
                send_events: true,
            },
            StateVariable {
                name: "ContainerUpdateIDs",
                data_type: DataType::String,
                allowed_values: &[],
                send_events: true,
            },
        ],
    }
}

struct ContentDirectory {
    collection: Arc<Collection>,
    base_url: Url,
}

impl ActionHandler for ContentDirectory {
    fn call(&self, action: &str, inputs: &[Value]) -> Result<Vec<Value>, ControlError> {
        match action {
            "Browse" => self.browse(inputs),
            "GetSearchCapabilities" => Ok(vec![Value::String(String::new())]),
            "GetSortCapabilities" => Ok(vec![Value::String(String::new())]),
            "GetSystemUpdateID" => Ok(vec![Value::Ui4(0)]),
            // the rest of the table succeeds with empty results; the
            // directory is read-only and transfers are a non-goal
            "Search" => Ok(vec![
                Value::String(didl::render(&self.collection, &self.base_url, &[])),
                Value::Ui4(0),
                Value::Ui4(0),
                Value::Ui4(0),
            ]),
            "CreateObject" => Ok(vec![
                Value::String(String::new()),
                Value::String(String::new()),
            ]),
            "DestroyObject" | "UpdateObject" | "StopTransferResource" | "DeleteResource" => {
                Ok(vec![])
            }
            "ImportResource" | "ExportResource" => Ok(vec![Value::Ui4(0)]),
            "GetTransferProgress" => Ok(vec![
                Value::String("STOPPED".to_string()),
                Value::String("0".to_string()),
                Value::String("0".to_string()),
            ]),
            "CreateReference" => Ok(vec![Value::String(String::new())]),
            _ => Err(ControlError::UnsupportedAction(action.to_string())),
        }
    }
}

impl ContentDirectory {
    fn browse(&self, inputs: &[Value]) -> Result<Vec<Value>, ControlError> {
        // inputs arrive in SCPD order: ObjectID, BrowseFlag, Filter,
        // StartingIndex, RequestedCount, SortCriteria
        let [
            Value::String(object_id),
            Value::String(browse_flag),
            Value::String(_filter),
            Value::Ui4(starting_index),
            Value::Ui4(requested_count),
            Value::String(_sort_criteria),
        ] = inputs
        else {
            return Err(ControlError::InvalidArguments(
                "unexpected Browse argument shape".to_string(),
            ));
        };

        match browse_flag.as_str() {
            BROWSE_DIRECT_CHILDREN => {}
            BROWSE_METADATA => return Err(ControlError::NotImplemented(BROWSE_METADATA)),
            _ => {
                return Err(ControlError::InvalidArguments(format!(
                    "unknown browse flag: {browse_flag}"
                )));
            }
        }

        let object_id: usize = object_id.parse().map_err(|_| {
            ControlError::InvalidArguments(format!("object id {object_id:?} is not an integer"))
        })?;

        // Filter and SortCriteria are accepted and ignored; renderers send
        // "*" and "" and expect walk order back.
        let children: Vec<&Entry> = self.collection.children(object_id).collect();
        let total_matches = children.len();

        let requested = if *requested_count == 0 {
            usize::MAX
        } else {
            *requested_count as usize
        };
        let selection: Vec<&Entry> = children
            .into_iter()
            .skip(*starting_index as usize)
            .take(requested)
            .collect();

        debug!(
            "browse {object_id}: {} of {total_matches} children",
            selection.len()
        );

        let result = didl::render(&self.collection, &self.base_url, &selection);
        Ok(vec![
            Value::String(result),
            Value::Ui4(selection.len() as u32),
            Value::Ui4(total_matches as u32),
            Value::Ui4(0),
        ])
    }
}
