// DIDL-Lite is the metadata document a Browse response carries. It gets
// XML-escaped wholesale when it is embedded in the SOAP envelope, so this
// module produces the raw document.

use url::Url;

use crate::collection::{Collection, Entry};

const CLASS_STORAGE_FOLDER: &str = "object.container.storageFolder";

pub fn render(collection: &Collection, base_url: &Url, selection: &[&Entry]) -> String {
    let mut result = String::from(
        r#"<DIDL-Lite xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/" xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/">"#,
    );

    for entry in selection {
        match entry {
            Entry::Container(container) => {
                let id = container.id;
                let parent_id = container.parent_id;
                let child_count = collection.child_count(container.id);
                let title = xml::escape::escape_str_attribute(&container.title);
                let storage_used = container.storage_used;
                result.push_str(&format!(
                    r#"<container id="{id}" parentID="{parent_id}" restricted="1" searchable="1" childCount="{child_count}"><dc:title>{title}</dc:title><upnp:class>{CLASS_STORAGE_FOLDER}</upnp:class><upnp:storageUsed>{storage_used}</upnp:storageUsed></container>"#
                ));
            }
            Entry::Item(item) => {
                let id = item.id;
                let parent_id = item.parent_id;
                let title = xml::escape::escape_str_attribute(&item.title);
                let class = item.class.upnp_class();
                let item_protocol_info = item.protocol_info();
                let protocol_info = xml::escape::escape_str_attribute(&item_protocol_info);
                let res_url = format!("{base_url}media/{id}");
                let res = xml::escape::escape_str_attribute(&res_url);
                result.push_str(&format!(
                    r#"<item id="{id}" parentID="{parent_id}" restricted="1"><dc:title>{title}</dc:title><upnp:class>{class}</upnp:class><res protocolInfo="{protocol_info}">{res}</res></item>"#
                ));
            }
        }
    }

    result.push_str("</DIDL-Lite>");
    result
}
